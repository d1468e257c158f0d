//! In-process status backend
//!
//! Same expiry semantics as the shared store, scoped to one process. Used by
//! tests and single-process clusters (`memory://`).
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::StatusBackend;
use crate::error::Result;

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, (Vec<u8>, Instant)>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl StatusBackend for MemoryBackend {
    async fn set_ex(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now() + ttl));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return Ok(None),
            Some(entry) if entry.1 > now => return Ok(Some(entry.0.clone())),
            Some(_) => {}
        }
        // Read guard is released above; expired entries are dropped lazily
        self.entries
            .remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        Ok(None)
    }
}
