//! JSON configuration file.
//!
//! Every field is optional; missing ones keep the engine defaults. Durations
//! are written in seconds.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use adaptive_engine::config::{HeaderMap, HeaderName};
use adaptive_engine::proxy::ProxyConfig;
use adaptive_engine::{AdaptationLogicKind, AdaptiveConfig};
use serde::Deserialize;
use tracing::debug;

use crate::error::{AppError, Result};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub http: HttpSection,
    pub fetch: FetchSection,
    pub buffering: BufferingSection,
    pub logic: LogicSection,
    pub playlist: PlaylistSection,
    pub events_capacity: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpSection {
    pub connect_timeout: Option<f64>,
    pub read_timeout: Option<f64>,
    pub user_agent: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub proxy: Option<String>,
    pub max_connections_per_host: Option<usize>,
    pub allow_local: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FetchSection {
    pub max_retries: Option<u32>,
    pub retrieve_timeout: Option<f64>,
    pub max_not_found: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BufferingSection {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub live_delay: Option<f64>,
    pub low_latency: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogicSection {
    pub kind: Option<String>,
    pub bitrate: Option<u64>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PlaylistSection {
    pub update_floor: Option<f64>,
    pub max_failed_updates: Option<u32>,
}

fn seconds(value: f64, field: &str) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| AppError::InvalidInput(format!("{field}: invalid duration {value}")))
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::parse(&text).map_err(|source| AppError::Config {
            path: path.display().to_string(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(config)
    }

    pub fn parse(text: &str) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Writes every field present in the file onto `config`.
    pub fn apply(&self, config: &mut AdaptiveConfig) -> Result<()> {
        let http = &self.http;
        if let Some(v) = http.connect_timeout {
            config.http.connect_timeout = seconds(v, "http.connect_timeout")?;
        }
        if let Some(v) = http.read_timeout {
            config.http.read_timeout = seconds(v, "http.read_timeout")?;
        }
        if let Some(v) = &http.user_agent {
            config.http.user_agent = v.clone();
        }
        if !http.headers.is_empty() {
            let headers = parse_headers(&http.headers)?;
            config.http = std::mem::take(&mut config.http).with_headers(&headers);
        }
        if let Some(v) = &http.proxy {
            config.http.proxy = Some(ProxyConfig::from_url(v.clone()));
        }
        if let Some(v) = http.max_connections_per_host {
            config.http.max_connections_per_host = v;
        }
        if let Some(v) = http.allow_local {
            config.http.allow_local = v;
        }

        if let Some(v) = self.fetch.max_retries {
            config.fetch.segment_retry.max_retries = v;
        }
        if let Some(v) = self.fetch.retrieve_timeout {
            config.fetch.retrieve_timeout = seconds(v, "fetch.retrieve_timeout")?;
        }
        if let Some(v) = self.fetch.max_not_found {
            config.fetch.max_not_found = v;
        }

        let buffering = &self.buffering;
        if let Some(v) = buffering.min {
            config.buffering.min_buffering = seconds(v, "buffering.min")?;
        }
        if let Some(v) = buffering.max {
            config.buffering.max_buffering = seconds(v, "buffering.max")?;
        }
        if let Some(v) = buffering.live_delay {
            config.buffering.live_delay = seconds(v, "buffering.live_delay")?;
        }
        if let Some(v) = buffering.low_latency {
            config.buffering.low_latency = v;
        }

        let logic = &self.logic;
        if let Some(kind) = &logic.kind {
            config.logic.kind = kind
                .parse::<AdaptationLogicKind>()
                .map_err(|_| AppError::InvalidInput(format!("logic.kind: unknown logic {kind}")))?;
        }
        if let Some(v) = logic.bitrate {
            config.logic.fixed_bitrate = v;
        }
        config.logic.max_width = logic.max_width.or(config.logic.max_width);
        config.logic.max_height = logic.max_height.or(config.logic.max_height);

        if let Some(v) = self.playlist.update_floor {
            config.playlist.update_floor = seconds(v, "playlist.update_floor")?;
        }
        if let Some(v) = self.playlist.max_failed_updates {
            config.playlist.max_failed_updates = v;
        }
        if let Some(v) = self.events_capacity {
            config.events_capacity = v;
        }
        Ok(())
    }
}

fn parse_headers(
    headers: &BTreeMap<String, String>,
) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = name
            .parse::<HeaderName>()
            .map_err(|_| AppError::InvalidInput(format!("invalid header name {name}")))?;
        let value = value
            .parse()
            .map_err(|_| AppError::InvalidInput(format!("invalid value for header {name}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_file_keeps_defaults() {
        let file = FileConfig::parse("{}").unwrap();
        let mut config = AdaptiveConfig::default();
        file.apply(&mut config).unwrap();
        assert_eq!(config.buffering.min_buffering, Duration::from_secs(6));
        assert_eq!(config.logic.kind, AdaptationLogicKind::Rate);
    }

    #[test]
    fn sections_are_mapped() {
        let text = r#"{
            "http": { "user_agent": "player/1.0", "proxy": "socks5://127.0.0.1:1080",
                      "headers": { "referer": "https://example.com/" } },
            "fetch": { "max_retries": 1, "max_not_found": 5 },
            "buffering": { "min": 2.5, "live_delay": 8 },
            "logic": { "kind": "fixed", "bitrate": 800000, "max_height": 720 },
            "playlist": { "update_floor": 1 }
        }"#;
        let mut config = AdaptiveConfig::default();
        FileConfig::parse(text).unwrap().apply(&mut config).unwrap();

        assert_eq!(config.http.user_agent, "player/1.0");
        assert!(config.http.proxy.is_some());
        assert!(config.http.headers.contains_key("referer"));
        assert_eq!(config.fetch.segment_retry.max_retries, 1);
        assert_eq!(config.fetch.max_not_found, 5);
        assert_eq!(config.buffering.min_buffering, Duration::from_millis(2500));
        assert_eq!(config.buffering.live_delay, Duration::from_secs(8));
        assert_eq!(config.logic.kind, AdaptationLogicKind::Fixed);
        assert_eq!(config.logic.fixed_bitrate, 800_000);
        assert_eq!(config.logic.max_height, Some(720));
        assert_eq!(config.playlist.update_floor, Duration::from_secs(1));
    }

    #[rstest]
    #[case(r#"{ "logic": { "kind": "fastest" } }"#)]
    #[case(r#"{ "buffering": { "min": -1 } }"#)]
    #[case(r#"{ "http": { "headers": { "bad header": "x" } } }"#)]
    fn invalid_values_are_reported(#[case] text: &str) {
        let mut config = AdaptiveConfig::default();
        let file = FileConfig::parse(text).unwrap();
        assert!(matches!(file.apply(&mut config), Err(AppError::InvalidInput(_))));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(FileConfig::parse(r#"{ "buffer": {} }"#).is_err());
    }
}
