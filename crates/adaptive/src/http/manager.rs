// Connection manager: source creation, queue routing and one-shot retrieval
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use manifest::{ByteRange, ID};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::{ConnectionFactory, ConnectionParams};
use super::downloader::{Downloader, RateObserver, TransferContext};
use super::pool::{ConnectionLease, ConnectionPool};
use super::source::{ChunkSource, ChunkType, SourceInner};
use crate::config::AdaptiveConfig;
use crate::error::TransportError;
use crate::metrics::PerformanceMetrics;

/// Body of a one-shot retrieval.
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Bytes,
}

pub struct ConnectionManager {
    pool: Arc<ConnectionPool>,
    transfers: Arc<TransferContext>,
    low_latency: Arc<Downloader>,
    bulk: Arc<Downloader>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    token: CancellationToken,
    activity: Arc<Notify>,
    next_id: AtomicU64,
    retrieve_timeout: Duration,
}

impl ConnectionManager {
    /// Starts the two downloader workers on `handle`.
    pub fn new(
        config: &AdaptiveConfig,
        factories: Vec<Arc<dyn ConnectionFactory>>,
        metrics: Arc<PerformanceMetrics>,
        handle: &Handle,
    ) -> Arc<Self> {
        let pool = Arc::new(ConnectionPool::new(
            factories,
            config.http.max_connections_per_host,
            config.http.allow_local,
        ));
        let transfers = Arc::new(TransferContext {
            pool: pool.clone(),
            retry: config.fetch.segment_retry.clone(),
            metrics,
            observer: RwLock::new(None),
        });
        let token = CancellationToken::new();
        let low_latency = Downloader::new("low-latency", token.child_token());
        let bulk = Downloader::new("bulk", token.child_token());

        let workers = vec![
            handle.spawn(low_latency.clone().run(transfers.clone())),
            handle.spawn(bulk.clone().run(transfers.clone())),
        ];

        Arc::new(Self {
            pool,
            transfers,
            low_latency,
            bulk,
            workers: Mutex::new(workers),
            token,
            activity: Arc::new(Notify::new()),
            next_id: AtomicU64::new(1),
            retrieve_timeout: config.fetch.retrieve_timeout,
        })
    }

    /// Signalled whenever any source receives data or finishes.
    pub fn activity(&self) -> Arc<Notify> {
        self.activity.clone()
    }

    pub fn set_rate_observer(&self, observer: Arc<dyn RateObserver>) {
        *self.transfers.observer.write() = Some(observer);
    }

    pub async fn get_connection(
        &self,
        params: &ConnectionParams,
    ) -> Result<ConnectionLease, TransportError> {
        self.pool.get_connection(params).await
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Creates a source without scheduling it.
    pub fn make_source(
        &self,
        url: &str,
        tag: Option<ID>,
        chunk_type: ChunkType,
        range: Option<ByteRange>,
    ) -> Result<ChunkSource, TransportError> {
        if self.token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let params = ConnectionParams::parse(url)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = SourceInner::new(
            id,
            params,
            tag,
            chunk_type,
            range,
            self.token.child_token(),
            self.activity.clone(),
        );
        Ok(ChunkSource::new(Arc::new(inner)))
    }

    fn queue_for(&self, chunk_type: ChunkType) -> &Arc<Downloader> {
        if chunk_type.is_low_latency() {
            &self.low_latency
        } else {
            &self.bulk
        }
    }

    pub fn start(&self, source: &ChunkSource) {
        self.queue_for(source.chunk_type())
            .schedule(source.inner().clone());
    }

    /// Cancels `source`; a queued source is dropped from its queue without
    /// ever touching the network.
    pub fn cancel(&self, source: &ChunkSource) {
        let dequeued = self.queue_for(source.chunk_type()).cancel(source.id());
        source.cancel();
        debug!(url = source.url(), dequeued, "Cancelled source");
    }

    /// Queued sources per queue (low latency, bulk).
    pub fn pending(&self) -> (usize, usize) {
        (self.low_latency.pending(), self.bulk.pending())
    }

    /// Fetches a small resource through the low latency queue.
    pub async fn retrieve(
        &self,
        chunk_type: ChunkType,
        url: &str,
    ) -> Result<Retrieved, TransportError> {
        let source = self.make_source(url, None, chunk_type, None)?;
        self.start(&source);
        match tokio::time::timeout(self.retrieve_timeout, source.collect()).await {
            Ok(body) => Ok(Retrieved {
                url: url.to_string(),
                content_type: source.content_type(),
                body: body?,
            }),
            Err(_) => {
                self.cancel(&source);
                Err(TransportError::timeout(format!("retrieving {url}")))
            }
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels every transfer, joins both workers and releases the pool.
    pub async fn shutdown(&self) {
        if self.token.is_cancelled() && self.workers.lock().is_empty() {
            return;
        }
        self.token.cancel();
        self.low_latency.shutdown();
        self.bulk.shutdown();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        self.pool.release_idle();
        info!(opened = self.pool.opened(), "Connection manager stopped");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.token.cancel();
        for worker in self.workers.get_mut().drain(..) {
            worker.abort();
        }
    }
}
