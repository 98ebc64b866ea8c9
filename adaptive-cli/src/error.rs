use adaptive_engine::{AdaptiveError, TransportError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] AdaptiveError),

    #[error("Invalid config file {path}: {source}")]
    Config {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Playback failed: {0}")]
    Playback(String),
}

impl From<TransportError> for AppError {
    fn from(error: TransportError) -> Self {
        AppError::Engine(error.into())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
