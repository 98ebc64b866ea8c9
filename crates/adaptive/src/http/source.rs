// Chunk sources: one-shot byte streams filled by a downloader worker
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use manifest::{ByteRange, ID};
use parking_lot::Mutex;
use strum::Display;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionParams;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChunkType {
    Init,
    Index,
    Segment,
    Key,
    Playlist,
}

impl ChunkType {
    /// Small, time-critical fetches served by the low-latency queue.
    pub fn is_low_latency(self) -> bool {
        matches!(self, ChunkType::Key | ChunkType::Playlist)
    }

    pub fn is_media(self) -> bool {
        !self.is_low_latency()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SourceState {
    Created,
    Queued,
    Transferring,
    Complete,
    Failed,
    Cancelled,
}

/// Result of a non-blocking read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Data(Bytes),
    /// Nothing buffered yet; the transfer is still running.
    Pending,
    Eof,
}

struct Transfer {
    state: SourceState,
    buffered: VecDeque<Bytes>,
    received: u64,
    content_type: Option<String>,
    content_length: Option<u64>,
    error: Option<TransportError>,
    started: Option<Instant>,
}

pub(crate) struct SourceInner {
    pub(crate) id: u64,
    pub(crate) params: ConnectionParams,
    pub(crate) tag: Option<ID>,
    pub(crate) chunk_type: ChunkType,
    pub(crate) range: Option<ByteRange>,
    pub(crate) token: CancellationToken,
    transfer: Mutex<Transfer>,
    changed: Notify,
    activity: Arc<Notify>,
}

impl SourceInner {
    pub(crate) fn new(
        id: u64,
        params: ConnectionParams,
        tag: Option<ID>,
        chunk_type: ChunkType,
        range: Option<ByteRange>,
        token: CancellationToken,
        activity: Arc<Notify>,
    ) -> Self {
        Self {
            id,
            params,
            tag,
            chunk_type,
            range,
            token,
            transfer: Mutex::new(Transfer {
                state: SourceState::Created,
                buffered: VecDeque::new(),
                received: 0,
                content_type: None,
                content_length: None,
                error: None,
                started: None,
            }),
            changed: Notify::new(),
            activity,
        }
    }

    fn signal(&self) {
        self.changed.notify_one();
        self.activity.notify_one();
    }

    pub(crate) fn received(&self) -> u64 {
        self.transfer.lock().received
    }

    pub(crate) fn state(&self) -> SourceState {
        self.transfer.lock().state
    }

    pub(crate) fn set_state(&self, state: SourceState) {
        let mut transfer = self.transfer.lock();
        if state == SourceState::Transferring && transfer.started.is_none() {
            transfer.started = Some(Instant::now());
        }
        transfer.state = state;
    }

    pub(crate) fn started(&self) -> Option<Instant> {
        self.transfer.lock().started
    }

    pub(crate) fn set_headers(&self, content_type: Option<String>, content_length: Option<u64>) {
        let mut transfer = self.transfer.lock();
        if transfer.content_type.is_none() {
            transfer.content_type = content_type;
        }
        if transfer.content_length.is_none() {
            transfer.content_length = content_length;
        }
    }

    pub(crate) fn push(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        {
            let mut transfer = self.transfer.lock();
            transfer.received += chunk.len() as u64;
            transfer.buffered.push_back(chunk);
        }
        self.signal();
    }

    pub(crate) fn finish(&self, outcome: Result<(), TransportError>) {
        {
            let mut transfer = self.transfer.lock();
            match outcome {
                Ok(()) => transfer.state = SourceState::Complete,
                Err(TransportError::Cancelled) => transfer.state = SourceState::Cancelled,
                Err(e) => {
                    transfer.state = SourceState::Failed;
                    transfer.error = Some(e);
                }
            }
        }
        self.signal();
    }
}

/// A one-shot readable byte stream bound to one chunk fetch.
///
/// Reads never block: [`Block::Pending`] is returned while the transfer has
/// not produced data yet. Dropping the source cancels its transfer.
pub struct ChunkSource {
    inner: Arc<SourceInner>,
}

impl ChunkSource {
    pub(crate) fn new(inner: Arc<SourceInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<SourceInner> {
        &self.inner
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        self.inner.params.as_str()
    }

    pub fn chunk_type(&self) -> ChunkType {
        self.inner.chunk_type
    }

    /// Bandwidth accounting tag, usually the adaptation set.
    pub fn tag(&self) -> Option<&ID> {
        self.inner.tag.as_ref()
    }

    pub fn range(&self) -> Option<ByteRange> {
        self.inner.range
    }

    pub fn state(&self) -> SourceState {
        if self.inner.token.is_cancelled() {
            return SourceState::Cancelled;
        }
        self.inner.state()
    }

    pub fn received(&self) -> u64 {
        self.inner.received()
    }

    pub fn content_type(&self) -> Option<String> {
        self.inner.transfer.lock().content_type.clone()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.inner.transfer.lock().content_length
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Stops the transfer. Safe from any thread; queued transfers never
    /// reach the network, running ones have their read interrupted.
    pub fn cancel(&self) {
        self.inner.token.cancel();
        self.inner.signal();
    }

    /// Returns at most `max` buffered bytes without waiting.
    pub fn read_block(&self, max: usize) -> Result<Block, TransportError> {
        if self.inner.token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let mut transfer = self.inner.transfer.lock();
        if let Some(mut chunk) = transfer.buffered.pop_front() {
            if max > 0 && chunk.len() > max {
                let rest = chunk.split_off(max);
                transfer.buffered.push_front(rest);
            }
            return Ok(Block::Data(chunk));
        }
        match transfer.state {
            SourceState::Complete => Ok(Block::Eof),
            SourceState::Cancelled => Err(TransportError::Cancelled),
            SourceState::Failed => Err(transfer.error.take().unwrap_or_else(|| {
                TransportError::unavailable(self.inner.params.as_str(), "transfer failed")
            })),
            SourceState::Created | SourceState::Queued | SourceState::Transferring => {
                Ok(Block::Pending)
            }
        }
    }

    /// Waits until the whole body is available.
    pub async fn collect(&self) -> Result<Bytes, TransportError> {
        let mut body = BytesMut::new();
        loop {
            match self.read_block(0)? {
                Block::Data(chunk) => body.extend_from_slice(&chunk),
                Block::Eof => return Ok(body.freeze()),
                Block::Pending => {
                    tokio::select! {
                        _ = self.inner.token.cancelled() => return Err(TransportError::Cancelled),
                        _ = self.inner.changed.notified() => {}
                    }
                }
            }
        }
    }
}

impl Drop for ChunkSource {
    fn drop(&mut self) {
        if !matches!(
            self.inner.state(),
            SourceState::Complete | SourceState::Failed | SourceState::Cancelled
        ) {
            self.inner.token.cancel();
        }
    }
}

impl std::fmt::Debug for ChunkSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSource")
            .field("id", &self.inner.id)
            .field("url", &self.url())
            .field("type", &self.inner.chunk_type)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> (Arc<SourceInner>, ChunkSource) {
        let inner = Arc::new(SourceInner::new(
            1,
            ConnectionParams::parse("http://h/seg.ts").unwrap(),
            Some(ID::new("video")),
            ChunkType::Segment,
            None,
            CancellationToken::new(),
            Arc::new(Notify::new()),
        ));
        (inner.clone(), ChunkSource::new(inner))
    }

    #[test]
    fn reads_are_non_blocking_and_bounded() {
        let (inner, source) = source();
        assert_eq!(source.read_block(4).unwrap(), Block::Pending);
        inner.push(Bytes::from_static(b"abcdef"));
        assert_eq!(
            source.read_block(4).unwrap(),
            Block::Data(Bytes::from_static(b"abcd"))
        );
        assert_eq!(
            source.read_block(4).unwrap(),
            Block::Data(Bytes::from_static(b"ef"))
        );
        inner.finish(Ok(()));
        assert_eq!(source.read_block(4).unwrap(), Block::Eof);
        assert_eq!(source.received(), 6);
    }

    #[test]
    fn cancelled_source_never_reports_success() {
        let (inner, source) = source();
        inner.push(Bytes::from_static(b"abc"));
        source.cancel();
        inner.finish(Ok(()));
        assert!(matches!(source.read_block(8), Err(TransportError::Cancelled)));
        assert_eq!(source.state(), SourceState::Cancelled);
    }

    #[test]
    fn failure_is_reported_once_with_its_cause() {
        let (inner, source) = source();
        inner.finish(Err(TransportError::NotFound {
            url: "http://h/seg.ts".to_string(),
        }));
        assert!(source.read_block(8).unwrap_err().is_not_found());
        assert!(matches!(
            source.read_block(8),
            Err(TransportError::Unavailable { .. })
        ));
    }

    #[test]
    fn chunk_routing() {
        assert!(ChunkType::Key.is_low_latency());
        assert!(ChunkType::Playlist.is_low_latency());
        assert!(ChunkType::Segment.is_media());
        assert!(ChunkType::Init.is_media());
        assert_eq!(ChunkType::Index.to_string(), "index");
    }
}
