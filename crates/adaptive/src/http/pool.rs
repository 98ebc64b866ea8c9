// Connection pool: reuse of idle connections per scheme/host/port/user
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::connection::{Connection, ConnectionFactory, ConnectionParams, PoolKey};
use crate::error::TransportError;

struct Slot {
    id: u64,
    key: PoolKey,
    /// `None` while the factory is still opening it.
    connection: Option<Arc<dyn Connection>>,
    busy: bool,
}

pub struct ConnectionPool {
    factories: Vec<Arc<dyn ConnectionFactory>>,
    slots: Mutex<Vec<Slot>>,
    max_per_host: usize,
    allow_local: bool,
    next_id: AtomicU64,
    opened: AtomicU64,
}

impl ConnectionPool {
    pub fn new(
        factories: Vec<Arc<dyn ConnectionFactory>>,
        max_per_host: usize,
        allow_local: bool,
    ) -> Self {
        Self {
            factories,
            slots: Mutex::new(Vec::new()),
            max_per_host: max_per_host.max(1),
            allow_local,
            next_id: AtomicU64::new(1),
            opened: AtomicU64::new(0),
        }
    }

    /// Reuses an idle connection matching `params` or opens a new one.
    /// The lease is exclusive until dropped.
    pub async fn get_connection(
        self: &Arc<Self>,
        params: &ConnectionParams,
    ) -> Result<ConnectionLease, TransportError> {
        if params.is_local() && !self.allow_local {
            return Err(TransportError::unavailable(
                params.as_str(),
                "local sources are disabled",
            ));
        }

        let key = params.pool_key();
        let id = {
            let mut slots = self.slots.lock();
            if let Some(slot) = slots
                .iter_mut()
                .find(|s| !s.busy && s.key == key && s.connection.is_some())
            {
                slot.busy = true;
                if let Some(connection) = slot.connection.clone() {
                    trace!(host = %key.host, id = slot.id, "Reusing pooled connection");
                    return Ok(ConnectionLease::new(self.clone(), slot.id, connection));
                }
            }
            let in_use = slots.iter().filter(|s| s.key == key).count();
            if in_use >= self.max_per_host {
                return Err(TransportError::unavailable(
                    params.as_str(),
                    format!("all {in_use} connections to {} are busy", key.host),
                ));
            }
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            slots.push(Slot {
                id,
                key: key.clone(),
                connection: None,
                busy: true,
            });
            id
        };

        // removes the reserved slot unless the connection opens
        let reservation = Reservation {
            pool: self.as_ref(),
            id,
            armed: true,
        };
        let Some(factory) = self.factories.iter().find(|f| f.accepts(params)) else {
            return Err(TransportError::unavailable(
                params.as_str(),
                format!("no connection factory accepts scheme `{}`", params.scheme()),
            ));
        };

        let connection = factory.create(params).await?;
        reservation.disarm();
        self.opened.fetch_add(1, Ordering::Relaxed);
        debug!(
            host = %key.host,
            factory = factory.name(),
            id,
            "Opened connection"
        );
        if let Some(slot) = self.slots.lock().iter_mut().find(|s| s.id == id) {
            slot.connection = Some(connection.clone());
        }
        Ok(ConnectionLease::new(self.clone(), id, connection))
    }

    /// Number of connections opened through factories so far.
    pub fn opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every idle connection.
    pub fn release_idle(&self) {
        self.slots.lock().retain(|s| s.busy);
    }

    fn remove(&self, id: u64) {
        self.slots.lock().retain(|s| s.id != id);
    }

    fn release(&self, id: u64, reusable: bool) {
        let mut slots = self.slots.lock();
        if !reusable {
            slots.retain(|s| s.id != id);
            return;
        }
        if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
            slot.busy = false;
        }
    }
}

/// Slot reserved while a factory opens its connection.
struct Reservation<'a> {
    pool: &'a ConnectionPool,
    id: u64,
    armed: bool,
}

impl Reservation<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.remove(self.id);
        }
    }
}

/// Exclusive use of a pooled connection.
pub struct ConnectionLease {
    pool: Arc<ConnectionPool>,
    id: u64,
    connection: Arc<dyn Connection>,
    reusable: bool,
}

impl ConnectionLease {
    fn new(pool: Arc<ConnectionPool>, id: u64, connection: Arc<dyn Connection>) -> Self {
        Self {
            pool,
            id,
            connection,
            reusable: true,
        }
    }

    pub fn connection(&self) -> &dyn Connection {
        self.connection.as_ref()
    }

    /// The connection is closed instead of returned to the pool.
    pub fn discard(&mut self) {
        self.reusable = false;
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.pool.release(self.id, self.reusable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::memory::MemoryFactory;

    fn pool(max: usize) -> (Arc<MemoryFactory>, Arc<ConnectionPool>) {
        let factory = Arc::new(MemoryFactory::new());
        let pool = Arc::new(ConnectionPool::new(vec![factory.clone()], max, false));
        (factory, pool)
    }

    #[tokio::test]
    async fn idle_connections_are_reused() {
        let (factory, pool) = pool(2);
        let params = ConnectionParams::parse("http://h/a.ts").unwrap();
        drop(pool.get_connection(&params).await.unwrap());
        drop(pool.get_connection(&params).await.unwrap());
        assert_eq!(factory.connections_opened(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn busy_connections_are_never_shared() {
        let (factory, pool) = pool(2);
        let params = ConnectionParams::parse("http://h/a.ts").unwrap();
        let first = pool.get_connection(&params).await.unwrap();
        let second = pool.get_connection(&params).await.unwrap();
        assert_eq!(factory.connections_opened(), 2);
        assert!(matches!(
            pool.get_connection(&params).await,
            Err(TransportError::Unavailable { .. })
        ));
        drop(first);
        drop(second);
        assert!(pool.get_connection(&params).await.is_ok());
    }

    #[tokio::test]
    async fn discarded_connections_leave_the_pool() {
        let (_, pool) = pool(2);
        let params = ConnectionParams::parse("http://h/a.ts").unwrap();
        let mut lease = pool.get_connection(&params).await.unwrap();
        lease.discard();
        drop(lease);
        assert!(pool.is_empty());
    }

    struct Stalled;

    #[async_trait::async_trait]
    impl ConnectionFactory for Stalled {
        fn name(&self) -> &'static str {
            "stalled"
        }

        fn accepts(&self, _: &ConnectionParams) -> bool {
            true
        }

        async fn create(
            &self,
            _: &ConnectionParams,
        ) -> Result<Arc<dyn Connection>, TransportError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn abandoned_open_frees_its_slot() {
        let pool = Arc::new(ConnectionPool::new(vec![Arc::new(Stalled)], 1, false));
        let params = ConnectionParams::parse("http://h/a.ts").unwrap();
        let opening = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            pool.get_connection(&params),
        )
        .await;
        assert!(opening.is_err());
        assert!(pool.is_empty());
    }

    #[tokio::test]
    async fn local_sources_refused_by_default() {
        let (factory, pool) = pool(2);
        let params = ConnectionParams::parse("file:///tmp/a.ts").unwrap();
        assert!(pool.get_connection(&params).await.is_err());
        assert_eq!(factory.connections_opened(), 0);
    }
}
