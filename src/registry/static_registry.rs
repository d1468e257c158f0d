use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use super::{Node, Registry, RegistryEvent};
use crate::error::Result;

const EVENT_CAPACITY: usize = 256;

/// In-memory registry fed from static topology or explicit register calls.
///
/// Each service's node list lives behind its own `Arc<Vec<Node>>`; a change
/// builds a new list and swaps it in.
pub struct StaticRegistry {
    services: RwLock<HashMap<String, Arc<Vec<Node>>>>,
    events: broadcast::Sender<RegistryEvent>,
    version: AtomicU64,
}

impl std::fmt::Debug for StaticRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticRegistry")
            .field("version", &self.version())
            .finish()
    }
}

impl Default for StaticRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            services: RwLock::new(HashMap::new()),
            events,
            version: AtomicU64::new(0),
        }
    }

    pub fn with_nodes(nodes: impl IntoIterator<Item = Node>) -> Self {
        let registry = Self::new();
        for node in nodes {
            registry.register(node);
        }
        registry
    }

    /// Add a node, replacing any node with the same id.
    /// Returns false if an identical node was already registered.
    pub fn register(&self, node: Node) -> bool {
        {
            let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
            let current = services
                .get(&node.service_name)
                .cloned()
                .unwrap_or_default();
            if current.iter().any(|existing| existing == &node) {
                return false;
            }

            let mut next: Vec<Node> = current
                .iter()
                .filter(|existing| existing.id != node.id)
                .cloned()
                .collect();
            next.push(node.clone());
            next.sort_by(|a, b| a.id.cmp(&b.id));
            services.insert(node.service_name.clone(), Arc::new(next));
        }
        self.version.fetch_add(1, Ordering::Relaxed);
        debug!("Registered node {}", node);
        // No subscribers is fine
        let _ = self.events.send(RegistryEvent::Registered(node));
        true
    }

    /// Remove a node by id
    pub fn deregister(&self, node_id: &str) -> Option<Node> {
        let removed = {
            let mut services = self.services.write().unwrap_or_else(|e| e.into_inner());
            let (service, current) = services
                .iter()
                .find(|(_, nodes)| nodes.iter().any(|n| n.id == node_id))
                .map(|(service, nodes)| (service.clone(), nodes.clone()))?;

            let removed = current.iter().find(|n| n.id == node_id).cloned();
            let next: Vec<Node> = current.iter().filter(|n| n.id != node_id).cloned().collect();
            if next.is_empty() {
                services.remove(&service);
            } else {
                services.insert(service, Arc::new(next));
            }
            removed
        }?;
        self.version.fetch_add(1, Ordering::Relaxed);
        debug!("Deregistered node {}", removed);
        let _ = self.events.send(RegistryEvent::Deregistered(removed.clone()));
        Some(removed)
    }

    /// Snapshot of a service's node list
    pub fn snapshot(&self, service_name: &str) -> Arc<Vec<Node>> {
        self.services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(service_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Bumped on every change
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn get_nodes(&self, service_name: &str) -> Result<Vec<Node>> {
        Ok(self.snapshot(service_name).as_ref().clone())
    }

    fn watch(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }
}
