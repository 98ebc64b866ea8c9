// Downloader workers: one FIFO of scheduled chunk sources per queue
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use manifest::ID;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::pool::ConnectionPool;
use super::retry::{RetryAction, RetryPolicy, retry_with_backoff};
use super::source::{SourceInner, SourceState};
use crate::error::TransportError;
use crate::metrics::PerformanceMetrics;

/// Receives `(bytes, elapsed, latency)` after each completed media transfer.
pub trait RateObserver: Send + Sync {
    fn update_download_rate(&self, tag: &ID, bytes: u64, elapsed: Duration, latency: Duration);
}

/// State shared by both workers.
pub(crate) struct TransferContext {
    pub(crate) pool: Arc<ConnectionPool>,
    pub(crate) retry: RetryPolicy,
    pub(crate) metrics: Arc<PerformanceMetrics>,
    pub(crate) observer: RwLock<Option<Arc<dyn RateObserver>>>,
}

impl TransferContext {
    /// `Range` header for the next attempt, `None` when nothing is left.
    fn resume_range(src: &SourceInner) -> Option<Option<String>> {
        let received = src.received();
        match src.range {
            Some(range) => range.advanced(received).map(|r| Some(r.header_value())),
            None if received > 0 => Some(Some(format!("bytes={received}-"))),
            None => Some(None),
        }
    }

    /// One request. Returns the time to first byte.
    async fn attempt(&self, src: &Arc<SourceInner>) -> Result<Duration, TransportError> {
        let Some(range) = Self::resume_range(src) else {
            return Ok(Duration::ZERO);
        };
        let received = src.received();
        let mut lease = self.pool.get_connection(&src.params).await?;

        let requested = Instant::now();
        let response = tokio::select! {
            biased;
            _ = src.token.cancelled() => {
                lease.discard();
                return Err(TransportError::Cancelled);
            }
            response = lease.connection().request(&src.params, range.as_deref()) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                lease.discard();
                return Err(e);
            }
        };
        let latency = requested.elapsed();
        src.set_headers(response.content_type.clone(), response.content_length);

        // a server ignoring the range replays bytes we already hold
        let mut skip = if received > 0 && !response.is_partial() {
            received
        } else {
            0
        };
        let mut body = response.body;
        loop {
            let next = tokio::select! {
                biased;
                _ = src.token.cancelled() => {
                    lease.discard();
                    return Err(TransportError::Cancelled);
                }
                next = body.next() => next,
            };
            match next {
                Some(Ok(mut chunk)) => {
                    if skip > 0 {
                        let dropped = skip.min(chunk.len() as u64);
                        let _ = chunk.split_to(dropped as usize);
                        skip -= dropped;
                    }
                    src.push(chunk);
                }
                Some(Err(e)) => {
                    lease.discard();
                    return Err(e);
                }
                None => return Ok(latency),
            }
        }
    }

    pub(crate) async fn execute(&self, src: &Arc<SourceInner>) {
        src.set_state(SourceState::Transferring);
        trace!(url = %src.params.as_str(), kind = %src.chunk_type, "Transfer started");

        let result = retry_with_backoff(&self.retry, &src.token, |_attempt| {
            let src = src.clone();
            async move { RetryAction::from(self.attempt(&src).await) }
        })
        .await;

        match result {
            Ok(latency) => {
                let elapsed = src.started().map(|s| s.elapsed()).unwrap_or_default();
                let bytes = src.received();
                if src.chunk_type.is_media() {
                    self.metrics.record_transfer(
                        bytes,
                        elapsed.as_millis() as u64,
                        latency.as_millis() as u64,
                    );
                    let observer = self.observer.read().clone();
                    if let (Some(observer), Some(tag)) = (observer, src.tag.as_ref()) {
                        observer.update_download_rate(tag, bytes, elapsed, latency);
                    }
                }
                debug!(
                    url = %src.params.as_str(),
                    kind = %src.chunk_type,
                    bytes,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Transfer complete"
                );
                src.finish(Ok(()));
            }
            Err(TransportError::Cancelled) => {
                self.metrics.record_cancelled();
                debug!(url = %src.params.as_str(), "Transfer cancelled");
                src.finish(Err(TransportError::Cancelled));
            }
            Err(e) => {
                self.metrics.record_transfer_error();
                if e.is_not_found() {
                    debug!(url = %src.params.as_str(), "Resource not found");
                } else {
                    warn!(url = %src.params.as_str(), error = %e, "Transfer failed");
                }
                src.finish(Err(e));
            }
        }
    }
}

/// A FIFO of scheduled sources served by one background task.
pub struct Downloader {
    name: &'static str,
    queue: Mutex<VecDeque<Arc<SourceInner>>>,
    wakeup: Notify,
    token: CancellationToken,
}

impl Downloader {
    pub(crate) fn new(name: &'static str, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            name,
            queue: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            token,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn schedule(&self, src: Arc<SourceInner>) {
        src.set_state(SourceState::Queued);
        self.queue.lock().push_back(src);
        self.wakeup.notify_one();
    }

    /// Removes a not yet started source. Returns false if it already left
    /// the queue.
    pub(crate) fn cancel(&self, id: u64) -> bool {
        let removed = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.retain(|s| s.id != id);
            before != queue.len()
        };
        if removed {
            trace!(queue = self.name, id, "Removed queued source");
            self.wakeup.notify_one();
        }
        removed
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn shutdown(&self) {
        self.token.cancel();
        self.wakeup.notify_one();
    }

    pub(crate) async fn run(self: Arc<Self>, transfers: Arc<TransferContext>) {
        debug!(queue = self.name, "Downloader started");
        loop {
            let next = self.queue.lock().pop_front();
            let Some(src) = next else {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => break,
                    _ = self.wakeup.notified() => continue,
                }
            };
            if src.token.is_cancelled() {
                src.finish(Err(TransportError::Cancelled));
                continue;
            }
            transfers.execute(&src).await;
        }

        let abandoned: Vec<_> = self.queue.lock().drain(..).collect();
        for src in abandoned {
            src.finish(Err(TransportError::Cancelled));
        }
        debug!(queue = self.name, "Downloader stopped");
    }
}
