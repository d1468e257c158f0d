//! Redis status backend
//!
//! Connections are kept in a small bounded pool. Every operation checks one
//! out through [`PooledConnection`], which hands it back on drop. A connection
//! that saw an error is discarded instead of returned.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::StatusBackend;
use crate::error::Result;

struct PoolInner {
    client: redis::Client,
    idle: Mutex<Vec<MultiplexedConnection>>,
    permits: Arc<Semaphore>,
}

pub struct RedisBackend {
    inner: Arc<PoolInner>,
    max_connections: usize,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// A checked-out connection; returned to the pool when dropped
struct PooledConnection {
    conn: MultiplexedConnection,
    pool: Arc<PoolInner>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    fn conn(&mut self) -> &mut MultiplexedConnection {
        &mut self.conn
    }

    fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.broken {
            debug!("Discarding broken status store connection");
            return;
        }
        // Multiplexed handles are cheap to clone
        self.pool
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(self.conn.clone());
    }
}

impl RedisBackend {
    /// Connections are opened lazily on first checkout
    pub fn new(url: &str, max_connections: usize) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let max_connections = max_connections.max(1);
        Ok(Self {
            inner: Arc::new(PoolInner {
                client,
                idle: Mutex::new(Vec::with_capacity(max_connections)),
                permits: Arc::new(Semaphore::new(max_connections)),
            }),
            max_connections,
        })
    }

    async fn checkout(&self) -> Result<PooledConnection> {
        let permit = self
            .inner
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| crate::transport_error!("status store pool closed"))?;

        let idle = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
        let conn = match idle {
            Some(conn) => conn,
            None => {
                debug!("Opening status store connection");
                self.inner.client.get_multiplexed_async_connection().await?
            }
        };

        Ok(PooledConnection {
            conn,
            pool: self.inner.clone(),
            broken: false,
            _permit: permit,
        })
    }
}

#[async_trait]
impl StatusBackend for RedisBackend {
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut pooled = self.checkout().await?;
        let result = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs())
            .query_async::<_, ()>(pooled.conn())
            .await;
        if result.is_err() {
            pooled.mark_broken();
        }
        Ok(result?)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut pooled = self.checkout().await?;
        let result = redis::cmd("GET")
            .arg(key)
            .query_async::<_, Option<Vec<u8>>>(pooled.conn())
            .await;
        if result.is_err() {
            pooled.mark_broken();
        }
        Ok(result?)
    }
}
