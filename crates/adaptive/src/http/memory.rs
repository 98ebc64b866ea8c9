// In-memory connection factory serving registered resources
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::RwLock;
use reqwest::StatusCode;

use super::connection::{Connection, ConnectionFactory, ConnectionParams, Response};
use crate::error::TransportError;

#[derive(Debug, Clone)]
enum Resource {
    Body {
        data: Bytes,
        content_type: Option<String>,
    },
    Status(u16),
    /// Headers arrive, the body never does.
    Hang,
}

#[derive(Default)]
struct Inner {
    resources: RwLock<HashMap<String, Resource>>,
    connections: AtomicUsize,
    requests: RwLock<Vec<String>>,
}

/// Serves registered URLs from memory. Used by tests and local playback.
#[derive(Clone, Default)]
pub struct MemoryFactory {
    inner: Arc<Inner>,
    chunk_size: usize,
}

impl MemoryFactory {
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            chunk_size: 16 * 1024,
        }
    }

    /// Bodies are streamed in pieces of at most `chunk_size` bytes.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Bytes>) {
        self.insert_typed(url, data, None);
    }

    pub fn insert_typed(
        &self,
        url: impl Into<String>,
        data: impl Into<Bytes>,
        content_type: Option<&str>,
    ) {
        self.inner.resources.write().insert(
            url.into(),
            Resource::Body {
                data: data.into(),
                content_type: content_type.map(str::to_string),
            },
        );
    }

    pub fn insert_status(&self, url: impl Into<String>, status: u16) {
        self.inner
            .resources
            .write()
            .insert(url.into(), Resource::Status(status));
    }

    pub fn insert_hanging(&self, url: impl Into<String>) {
        self.inner
            .resources
            .write()
            .insert(url.into(), Resource::Hang);
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    /// URLs requested so far, in order.
    pub fn requests(&self) -> Vec<String> {
        self.inner.requests.read().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.inner
            .requests
            .read()
            .iter()
            .filter(|u| u.as_str() == url)
            .count()
    }
}

#[async_trait]
impl ConnectionFactory for MemoryFactory {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn accepts(&self, _params: &ConnectionParams) -> bool {
        true
    }

    async fn create(
        &self,
        _params: &ConnectionParams,
    ) -> Result<Arc<dyn Connection>, TransportError> {
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            inner: self.inner.clone(),
            chunk_size: self.chunk_size.max(1),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    chunk_size: usize,
}

/// Parses `bytes=start-[end]`.
fn parse_range(value: &str, len: u64) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => len.checked_sub(1)?,
        end => end.parse::<u64>().ok()?.min(len.checked_sub(1)?),
    };
    (start <= end).then_some((start, end))
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn request(
        &self,
        params: &ConnectionParams,
        range: Option<&str>,
    ) -> Result<Response, TransportError> {
        let url = params.as_str().to_string();
        self.inner.requests.write().push(url.clone());
        let resource = self.inner.resources.read().get(&url).cloned();
        let (data, content_type) = match resource {
            None => return Err(TransportError::NotFound { url }),
            Some(Resource::Status(code)) => {
                let status = StatusCode::from_u16(code)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                return Err(TransportError::http_status(status, url, "GET"));
            }
            Some(Resource::Hang) => {
                return Ok(Response {
                    status: 200,
                    content_type: None,
                    content_length: None,
                    body: futures::stream::pending().boxed(),
                });
            }
            Some(Resource::Body { data, content_type }) => (data, content_type),
        };

        let (status, data) = match range.and_then(|r| parse_range(r, data.len() as u64)) {
            Some((start, end)) => (206, data.slice(start as usize..=end as usize)),
            None => (200, data),
        };
        let chunks: Vec<Result<Bytes, TransportError>> = data
            .chunks(self.chunk_size)
            .map(|c| Ok(data.slice_ref(c)))
            .collect();
        Ok(Response {
            status,
            content_type,
            content_length: Some(data.len() as u64),
            body: futures::stream::iter(chunks).boxed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn body(response: Response) -> Vec<u8> {
        let chunks: Vec<Bytes> = response.body.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn serves_ranges() {
        let factory = MemoryFactory::new().with_chunk_size(3);
        factory.insert("http://h/a", &b"0123456789"[..]);
        let params = ConnectionParams::parse("http://h/a").unwrap();
        let conn = factory.create(&params).await.unwrap();

        let full = conn.request(&params, None).await.unwrap();
        assert_eq!(full.status, 200);
        assert_eq!(body(full).await, b"0123456789");

        let partial = conn.request(&params, Some("bytes=4-")).await.unwrap();
        assert!(partial.is_partial());
        assert_eq!(body(partial).await, b"456789");

        let bounded = conn.request(&params, Some("bytes=2-3")).await.unwrap();
        assert_eq!(body(bounded).await, b"23");
        assert_eq!(factory.request_count("http://h/a"), 3);
    }

    #[tokio::test]
    async fn missing_and_failing_resources() {
        let factory = MemoryFactory::new();
        factory.insert_status("http://h/busy", 503);
        let conn = factory
            .create(&ConnectionParams::parse("http://h/x").unwrap())
            .await
            .unwrap();
        let missing = conn
            .request(&ConnectionParams::parse("http://h/x").unwrap(), None)
            .await;
        assert!(matches!(missing, Err(TransportError::NotFound { .. })));
        let busy = conn
            .request(&ConnectionParams::parse("http://h/busy").unwrap(), None)
            .await;
        assert!(busy.unwrap_err().is_retryable());
    }
}
