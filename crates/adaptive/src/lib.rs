//! # Adaptive Engine
//!
//! Adaptive HTTP streaming client for HLS, DASH and Smooth Streaming.
//!
//! A [`PlaylistManager`] owns the parsed [`manifest::Manifest`] and one
//! [`StreamPipeline`] per adaptation set. Each pipeline picks the next chunk
//! through an adaptation logic, fetches it without blocking through the
//! shared [`ConnectionManager`], decrypts it, demuxes it and queues the
//! resulting elementary stream commands until the player clock reaches them.
//!
//! ## Features
//!
//! - Bandwidth, predictive, fixed, lowest and highest adaptation logics
//! - Two downloader queues with per host connection pooling and retries
//! - AES-128 segment decryption with a shared key cache
//! - Live playlist refresh with exponential backoff on failures
//! - Timestamp fixing and track recycling across representation switches
//!
//! ## License
//!
//! MIT License
//!
//! ## Authors
//!
//! - hua0512
//!

pub mod config;
pub mod context;
pub mod encryption;
pub mod error;
pub mod events;
pub mod http;
pub mod logic;
pub mod manager;
pub mod metrics;
pub mod plumbing;
pub mod proxy;
pub mod stream;

pub use config::{
    AdaptationLogicKind, AdaptiveConfig, BufferingConfig, FetchConfig, HttpConfig, LogicConfig,
    PlaylistConfig,
};
pub use context::{Context, ContextBuilder};
pub use encryption::{KeyMaterial, Keyring};
pub use error::{AdaptiveError, DemuxError, EncryptionError, TransportError};
pub use events::{ManagerEvent, TrackerEvent};
pub use http::{ChunkSource, ChunkType, ConnectionFactory, ConnectionManager, RetryPolicy};
pub use manager::{ControlQuery, ControlReply, ManagerState, PlaylistManager};
pub use metrics::{MetricsSnapshot, PerformanceMetrics};
pub use plumbing::{
    DemuxStatus, Demuxer, DemuxerFactory, EsBlock, EsCommand, EsOutput, TrackFormat, TrackId,
};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use stream::{BufferingStatus, StreamPipeline};

pub use manifest;
