use std::time::Duration;

pub use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use strum::{Display, EnumString};

use crate::http::RetryPolicy;
use crate::proxy::ProxyConfig;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveConfig {
    pub http: HttpConfig,
    pub fetch: FetchConfig,
    pub buffering: BufferingConfig,
    pub logic: LogicConfig,
    pub playlist: PlaylistConfig,
    /// Capacity of the outbound event channel. Events are dropped when full.
    pub events_capacity: usize,
}

impl AdaptiveConfig {
    pub fn with_events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    pub(crate) fn events_capacity(&self) -> usize {
        if self.events_capacity == 0 {
            64
        } else {
            self.events_capacity
        }
    }
}

/// HTTP client and connection pool options.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Read timeout (maximum time between receiving data chunks)
    pub read_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool,

    // --- Connection Pool Configuration ---
    /// Maximum number of pooled connections per scheme/host/port.
    pub max_connections_per_host: usize,

    /// Maximum idle connections kept by the underlying client per host
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,

    /// Allow `file://` and other non-network sources.
    pub allow_local: bool,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: HttpConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            max_connections_per_host: 8,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
            allow_local: false,
        }
    }
}

impl HttpConfig {
    /// Merges custom headers over the defaults; custom values win.
    pub fn with_headers(mut self, custom: &HeaderMap) -> Self {
        for (name, value) in custom.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));
        default_headers
    }
}

/// Segment, key and playlist fetch behavior.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Backoff for media chunk transfers. Retries resume with a byte range.
    pub segment_retry: RetryPolicy,

    /// Timeout applied to key and playlist retrievals.
    pub retrieve_timeout: Duration,

    /// Consecutive missing segments skipped before a stream gives up.
    pub max_not_found: u32,

    /// Read size handed to demuxers per block.
    pub block_size: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            segment_retry: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                jitter: true,
            },
            retrieve_timeout: Duration::from_secs(10),
            max_not_found: 3,
            block_size: 64 * 1024,
        }
    }
}

/// Buffering targets, all in media time.
#[derive(Debug, Clone)]
pub struct BufferingConfig {
    /// Buffer level considered enough to start playback.
    pub min_buffering: Duration,

    /// Buffer level above which demuxing pauses.
    pub max_buffering: Duration,

    /// Distance kept from the live edge at start.
    pub live_delay: Duration,

    /// Floor applied to every buffering target.
    pub lowest_buffering: Duration,

    /// Shrinks targets for low latency live streams.
    pub low_latency: bool,

    /// Upper bound on demux steps per stream in a single bufferize call.
    pub max_demux_steps: usize,
}

impl Default for BufferingConfig {
    fn default() -> Self {
        Self {
            min_buffering: Duration::from_secs(6),
            max_buffering: Duration::from_secs(30),
            live_delay: Duration::from_secs(15),
            lowest_buffering: Duration::from_secs(2),
            low_latency: false,
            max_demux_steps: 64,
        }
    }
}

/// Representation selection policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum AdaptationLogicKind {
    Lowest,
    Highest,
    /// Windowed download rate estimate.
    #[default]
    Rate,
    /// Always the representation closest to a configured bitrate.
    Fixed,
    /// Buffer level driven selection.
    Predictive,
    /// Utility maximisation over the buffered duration.
    #[strum(serialize = "near-optimal")]
    NearOptimal,
}

#[derive(Debug, Clone, Default)]
pub struct LogicConfig {
    pub kind: AdaptationLogicKind,

    /// Target bitrate for [`AdaptationLogicKind::Fixed`], bits per second.
    pub fixed_bitrate: u64,

    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

/// Live playlist refresh.
#[derive(Debug, Clone)]
pub struct PlaylistConfig {
    /// Lower bound between two refreshes.
    pub update_floor: Duration,

    /// Consecutive refresh failures after which a live manifest is stalled.
    pub max_failed_updates: u32,

    /// Backoff applied to the refresh interval after failures.
    pub refresh_backoff: RetryPolicy,

    /// Timeout of the initial manifest fetch.
    pub initial_fetch_timeout: Duration,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            update_floor: Duration::from_secs(5),
            max_failed_updates: 3,
            refresh_backoff: RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_secs(1),
                max_delay: Duration::from_secs(30),
                jitter: false,
            },
            initial_fetch_timeout: Duration::from_secs(15),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn logic_kind_names() {
        assert_eq!(
            AdaptationLogicKind::from_str("predictive").unwrap(),
            AdaptationLogicKind::Predictive
        );
        assert_eq!(AdaptationLogicKind::Lowest.to_string(), "lowest");
        assert_eq!(
            AdaptationLogicKind::from_str("near-optimal").unwrap(),
            AdaptationLogicKind::NearOptimal
        );
        assert_eq!(AdaptationLogicKind::default(), AdaptationLogicKind::Rate);
    }

    #[test]
    fn custom_headers_override_defaults() {
        let mut custom = HeaderMap::new();
        custom.insert(reqwest::header::ACCEPT, HeaderValue::from_static("text/plain"));
        let http = HttpConfig::default().with_headers(&custom);
        assert_eq!(http.headers[reqwest::header::ACCEPT], "text/plain");
        assert!(http.headers.contains_key(reqwest::header::ACCEPT_ENCODING));
    }

    #[test]
    fn zero_event_capacity_falls_back() {
        assert_eq!(AdaptiveConfig::default().events_capacity(), 64);
        assert_eq!(
            AdaptiveConfig::default()
                .with_events_capacity(4)
                .events_capacity(),
            4
        );
    }
}
