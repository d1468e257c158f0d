//! Node selection strategies
//!
//! A strategy only ever sees a non-empty candidate list; the selector has
//! already reported `NoNodeAvailable` otherwise. Returning `None` is still
//! allowed and is treated the same way.
use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use rand::Rng;
use serde_json::Value;
use siphasher::sip::SipHasher24;
use tracing::debug;

use crate::registry::Node;
use crate::status::StatusStore;

#[async_trait]
pub trait Strategy: Send + Sync {
    async fn select(&self, service: &str, nodes: &[Node], params: &[Value]) -> Option<Node>;
}

/// Uniform random pick
#[derive(Clone, Copy, Debug, Default)]
pub struct RandomStrategy;

#[async_trait]
impl Strategy for RandomStrategy {
    async fn select(&self, _service: &str, nodes: &[Node], _params: &[Value]) -> Option<Node> {
        if nodes.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..nodes.len());
        nodes.get(index).cloned()
    }
}

/// Cycles through the candidates; one counter per service name
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    counters: DashMap<String, AtomicUsize>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the service's counter by one and map it onto `len` slots
    pub fn next_index(&self, service: &str, len: usize) -> Option<usize> {
        if len == 0 {
            return None;
        }
        if let Some(counter) = self.counters.get(service) {
            return Some(counter.fetch_add(1, Ordering::Relaxed) % len);
        }
        let counter = self
            .counters
            .entry(service.to_string())
            .or_insert_with(|| AtomicUsize::new(0));
        Some(counter.fetch_add(1, Ordering::Relaxed) % len)
    }

    pub fn pick(&self, service: &str, nodes: &[Node]) -> Option<Node> {
        self.next_index(service, nodes.len())
            .and_then(|i| nodes.get(i).cloned())
    }
}

#[async_trait]
impl Strategy for RoundRobinStrategy {
    async fn select(&self, service: &str, nodes: &[Node], _params: &[Value]) -> Option<Node> {
        self.pick(service, nodes)
    }
}

/// Prefers the running node reporting the lowest load.
///
/// Nodes whose record is missing, expired or `running=false` are skipped.
/// Ties among the least loaded go round-robin, and so does the whole
/// candidate set when nothing is known about any node.
#[derive(Debug)]
pub struct LoadAwareStrategy {
    status: StatusStore,
    fallback: RoundRobinStrategy,
}

impl LoadAwareStrategy {
    pub fn new(status: StatusStore) -> Self {
        Self {
            status,
            fallback: RoundRobinStrategy::new(),
        }
    }
}

#[async_trait]
impl Strategy for LoadAwareStrategy {
    async fn select(&self, service: &str, nodes: &[Node], _params: &[Value]) -> Option<Node> {
        let mut least: Vec<Node> = Vec::new();
        let mut least_load = i64::MAX;
        for node in nodes {
            let record = self.status.read(&node.id).await;
            if !record.running {
                continue;
            }
            if record.load_hash < least_load {
                least_load = record.load_hash;
                least.clear();
            }
            if record.load_hash == least_load {
                least.push(node.clone());
            }
        }

        if least.is_empty() {
            debug!("No status known for {}; falling back to round-robin", service);
            return self.fallback.pick(service, nodes);
        }
        if least.len() == 1 {
            return least.pop();
        }
        self.fallback.pick(service, &least)
    }
}

/// Sticky routing: the same key always lands on the same node while the
/// candidate set is unchanged. The key is the first call param; calls without
/// one go round-robin.
///
/// Keys are hashed with fixed-key SipHash-2-4, so every node routes a key the
/// same way regardless of the toolchain it was built with.
#[derive(Debug, Default)]
pub struct KeyHashStrategy {
    fallback: RoundRobinStrategy,
}

impl KeyHashStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Strategy for KeyHashStrategy {
    async fn select(&self, service: &str, nodes: &[Node], params: &[Value]) -> Option<Node> {
        let key = match params.first() {
            Some(Value::String(key)) => key.clone(),
            Some(other) => other.to_string(),
            None => return self.fallback.pick(service, nodes),
        };
        let bucket = jump_consistent_hash(&key, nodes.len() as u32);
        nodes.get(bucket as usize).cloned()
    }
}

/// SipHash-2-4 of the key bytes with zero keys. Must not change between
/// releases: nodes running different builds have to agree on it.
pub fn stable_key_hash(key: &str) -> u64 {
    let mut hasher = SipHasher24::new();
    hasher.write(key.as_bytes());
    hasher.finish()
}

pub const MAGIC_CONSTANT: u64 = 2862933555777941757;

/// Jump consistent hashing
/// Based on:
/// https://arxiv.org/ftp/arxiv/papers/1406/1406.2294.pdf
pub fn jump_consistent_hash(key: &str, number_of_buckets: u32) -> u32 {
    if number_of_buckets == 0 {
        return 0;
    }
    let mut key_as_u64 = stable_key_hash(key);
    let bucket_num = number_of_buckets as i64;

    let mut b: i64 = -1;
    let mut j: i64 = 0;
    while j < bucket_num {
        b = j;
        key_as_u64 = key_as_u64.wrapping_mul(MAGIC_CONSTANT).wrapping_add(1);
        j = ((b + 1) as f64 * ((1i64 << 31) as f64 / ((key_as_u64 >> 33) + 1) as f64)) as i64;
    }
    b as u32
}
