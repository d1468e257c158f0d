//! Per-node liveness and load records in an expiring key-value store.
//!
//! Status publication is best-effort telemetry: failures are logged and
//! swallowed here and never reach the caller. With no store configured every
//! node reads as healthy with zero load.
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::Result;
use crate::settings::Settings;

pub mod memory;
pub mod redis_backend;
pub mod reporter;

pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;
pub use reporter::{LoadProbe, StatusReporter};

pub const STATUS_EXPIRE_TIME: Duration = Duration::from_secs(30);

pub fn status_key(server_id: &str) -> String {
    format!("status_{}", server_id)
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatusRecord {
    #[serde(rename = "Running")]
    pub running: bool,
    #[serde(rename = "LoadHash")]
    pub load_hash: i64,
}

impl ServerStatusRecord {
    /// What every node looks like when no store is configured
    pub fn assumed_healthy() -> Self {
        Self {
            running: true,
            load_hash: 0,
        }
    }

    /// Missing, expired or unreadable record
    pub fn offline() -> Self {
        Self::default()
    }
}

/// Expiring key-value store holding status records
#[async_trait]
pub trait StatusBackend: Send + Sync {
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

#[derive(Clone, Default)]
pub struct StatusStore {
    backend: Option<Arc<dyn StatusBackend>>,
}

impl std::fmt::Debug for StatusStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusStore")
            .field("configured", &self.is_configured())
            .finish()
    }
}

impl StatusStore {
    pub fn new(backend: Arc<dyn StatusBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn unconfigured() -> Self {
        Self { backend: None }
    }

    /// Pick a backend from the configured url scheme
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        match settings.status_store_url.as_deref() {
            None => Ok(Self::unconfigured()),
            Some(url) if url.starts_with("memory://") => {
                Ok(Self::new(Arc::new(MemoryBackend::new())))
            }
            Some(url) => Ok(Self::new(Arc::new(RedisBackend::new(
                url,
                settings.status_pool_size,
            )?))),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.backend.is_some()
    }

    /// Publish a status record with the standard expiry
    pub async fn save(&self, server_id: &str, running: bool, load_hash: i64) {
        let backend = match &self.backend {
            Some(backend) => backend,
            None => return,
        };

        let key = status_key(server_id);
        let record = ServerStatusRecord { running, load_hash };
        let value = match serde_json::to_vec(&record) {
            Ok(value) => value,
            Err(e) => {
                error!("SaveServerStatus ({}) status marshal fail: ({})", key, e);
                return;
            }
        };

        if let Err(e) = backend.set_ex(&key, value, STATUS_EXPIRE_TIME).await {
            error!(
                "SaveServerStatus ({}) expire ({}s) fail: ({})",
                key,
                STATUS_EXPIRE_TIME.as_secs(),
                e
            );
        }
    }

    pub async fn read(&self, server_id: &str) -> ServerStatusRecord {
        let backend = match &self.backend {
            Some(backend) => backend,
            None => return ServerStatusRecord::assumed_healthy(),
        };

        let key = status_key(server_id);
        let data = match backend.get(&key).await {
            Ok(Some(data)) => data,
            Ok(None) => {
                debug!("ReadServerStatus ({}) no record", key);
                return ServerStatusRecord::offline();
            }
            Err(e) => {
                error!("ReadServerStatus ({}) fail: ({})", key, e);
                return ServerStatusRecord::offline();
            }
        };

        serde_json::from_slice(&data).unwrap_or_else(|e| {
            error!("ReadServerStatus ({}) unmarshal fail: ({})", key, e);
            ServerStatusRecord::offline()
        })
    }
}
