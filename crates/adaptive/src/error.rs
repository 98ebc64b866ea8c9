use manifest::{ID, ParseError};
use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("resource not found: {url}")]
    NotFound { url: String },

    #[error("operation timed out: {reason}")]
    Timeout { reason: String },

    #[error("no connection available for {url}: {reason}")]
    Unavailable { url: String, reason: String },

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("transfer cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        if status == StatusCode::NOT_FOUND {
            return Self::NotFound { url: url.into() };
        }
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn unavailable(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    /// Whether requeuing the same fetch may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { source } => crate::http::is_retryable_reqwest_error(source),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Timeout { .. } => true,
            Self::NotFound { .. }
            | Self::Unavailable { .. }
            | Self::InvalidUrl { .. }
            | Self::Cancelled => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EncryptionError {
    #[error("key fetch failed for {uri}: {source}")]
    KeyFetch {
        uri: String,
        #[source]
        source: TransportError,
    },

    #[error("invalid key from {uri}: expected 16 bytes, got {len}")]
    InvalidKey { uri: String, len: usize },

    #[error("encrypted segment has no key URI")]
    MissingKeyUri,

    #[error("unsupported encryption method {method}")]
    UnsupportedMethod { method: String },

    #[error("decryption failed: {reason}")]
    Decrypt { reason: String },
}

impl EncryptionError {
    pub fn decrypt(reason: impl Into<String>) -> Self {
        Self::Decrypt {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DemuxError {
    #[error("no demuxer registered for format `{format}`")]
    NoDemuxer { format: String },

    #[error("demuxer `{name}` failed: {reason}")]
    Failed { name: String, reason: String },
}

impl DemuxError {
    pub fn failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Failed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdaptiveError {
    #[error("manifest error: {0}")]
    Parse(#[from] ParseError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("demux error: {0}")]
    Demux(#[from] DemuxError),

    #[error("invalid state: {reason}")]
    InvalidState { reason: String },

    #[error("unsupported: {reason}")]
    Unsupported { reason: String },

    #[error("runtime error: {reason}")]
    Runtime { reason: String },

    #[error("no usable representation left in adaptation set {set}")]
    NoUsableRepresentation { set: ID },
}

impl AdaptiveError {
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    pub fn runtime(reason: impl Into<String>) -> Self {
        Self::Runtime {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn not_found_is_classified_separately() {
        let err = TransportError::http_status(StatusCode::NOT_FOUND, "http://h/a.ts", "segment");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[rstest]
    #[case(StatusCode::BAD_GATEWAY, true)]
    #[case(StatusCode::SERVICE_UNAVAILABLE, true)]
    #[case(StatusCode::TOO_MANY_REQUESTS, true)]
    #[case(StatusCode::FORBIDDEN, false)]
    #[case(StatusCode::GONE, false)]
    fn status_retry_classification(#[case] status: StatusCode, #[case] retryable: bool) {
        let err = TransportError::http_status(status, "http://h/a.ts", "segment");
        assert_eq!(err.is_retryable(), retryable);
    }

    #[test]
    fn cancellation_is_final() {
        assert!(!TransportError::Cancelled.is_retryable());
    }
}
