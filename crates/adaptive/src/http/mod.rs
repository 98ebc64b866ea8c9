//! HTTP scheduling: connection pooling, two downloader queues, chunk
//! sources and retry policy.

mod connection;
mod downloader;
mod manager;
pub mod memory;
mod pool;
mod retry;
mod source;

pub use connection::{
    BodyStream, Connection, ConnectionFactory, ConnectionParams, PoolKey, ReqwestFactory,
    Response, create_client, install_rustls_provider,
};
pub use downloader::{Downloader, RateObserver};
pub use manager::{ConnectionManager, Retrieved};
pub use pool::{ConnectionLease, ConnectionPool};
pub use retry::{RetryAction, RetryPolicy, is_retryable_reqwest_error, retry_with_backoff};
pub use source::{Block, ChunkSource, ChunkType, SourceState};
