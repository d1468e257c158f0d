//! Service discovery interface
//!
//! The registry supplies the live node set for a service name and a stream of
//! change events. Node sets are replaced wholesale, never edited in place, so
//! a reader holding an `Arc<Vec<Node>>` never sees a half-applied change.
use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::Result;

pub mod static_registry;

pub use static_registry::StaticRegistry;

/// Split `service@instance` into its two halves
pub fn split_node_id(node_id: &str) -> Option<(&str, &str)> {
    match node_id.split_once('@') {
        Some((service, instance)) if !service.is_empty() && !instance.is_empty() => {
            Some((service, instance))
        }
        _ => None,
    }
}

/// An addressable instance of a named service
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub service_name: String,
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        service_name: impl Into<String>,
        address: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Self {
            id: id.into(),
            service_name: service_name.into(),
            address: address.into(),
            metadata,
        }
    }

    /// Build a node whose service name is derived from its `service@instance` id
    pub fn from_id(node_id: &str, address: &str, metadata: HashMap<String, String>) -> Self {
        let service = split_node_id(node_id)
            .map(|(service, _)| service)
            .unwrap_or(node_id);
        Self::new(node_id, service, address, metadata)
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.id, self.address)
    }
}

/// Registry change notification
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(Node),
    Deregistered(Node),
}

impl RegistryEvent {
    pub fn node(&self) -> &Node {
        match self {
            RegistryEvent::Registered(node) | RegistryEvent::Deregistered(node) => node,
        }
    }
}

#[async_trait]
pub trait Registry: Send + Sync {
    /// Current node set for a service, ordered by node id
    async fn get_nodes(&self, service_name: &str) -> Result<Vec<Node>>;

    /// Subscribe to node set changes
    fn watch(&self) -> broadcast::Receiver<RegistryEvent>;
}
