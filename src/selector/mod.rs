//! Node selection: registry lookup, filter chain, strategy.
//!
//! Process-wide defaults live on the [`Selector`]; each call may pass
//! [`SelectOptions`] overrides. Filters append to the default chain, while a
//! strategy or params given per call replace the defaults.
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{MeshError, Result};
use crate::registry::{Node, Registry, RegistryEvent};

pub mod filter;
pub mod strategy;

pub use filter::{ExcludeFilter, Filter, MetadataFilter};
pub use strategy::{
    jump_consistent_hash, KeyHashStrategy, LoadAwareStrategy, RandomStrategy, RoundRobinStrategy,
    Strategy,
};

#[derive(Clone, Default)]
pub struct SelectOptions {
    pub filters: Vec<Arc<dyn Filter>>,
    pub strategy: Option<Arc<dyn Strategy>>,
    pub params: Option<Vec<Value>>,
}

impl std::fmt::Debug for SelectOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectOptions")
            .field("filters", &self.filters.len())
            .field("strategy", &self.strategy.is_some())
            .field("params", &self.params)
            .finish()
    }
}

impl SelectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = Some(params);
        self
    }

    /// Layer these options over `defaults`
    pub fn merged_over(&self, defaults: &SelectOptions) -> SelectOptions {
        let mut filters = defaults.filters.clone();
        filters.extend(self.filters.iter().cloned());
        SelectOptions {
            filters,
            strategy: self.strategy.clone().or_else(|| defaults.strategy.clone()),
            params: self.params.clone().or_else(|| defaults.params.clone()),
        }
    }
}

/// Advisory callback fired on registry changes
pub trait Watcher: Send + Sync {
    fn on_change(&self, event: &RegistryEvent);
}

impl<F> Watcher for F
where
    F: Fn(&RegistryEvent) + Send + Sync,
{
    fn on_change(&self, event: &RegistryEvent) {
        self(event)
    }
}

pub struct Selector {
    registry: Arc<dyn Registry>,
    defaults: SelectOptions,
    fallback: Arc<dyn Strategy>,
}

impl std::fmt::Debug for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selector")
            .field("defaults", &self.defaults)
            .finish()
    }
}

impl Selector {
    /// Without a default strategy, selection is uniform random
    pub fn new(registry: Arc<dyn Registry>, defaults: SelectOptions) -> Self {
        Self {
            registry,
            defaults,
            fallback: Arc::new(RandomStrategy),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub fn defaults(&self) -> &SelectOptions {
        &self.defaults
    }

    pub async fn select(&self, service: &str, overrides: &SelectOptions) -> Result<Node> {
        let options = overrides.merged_over(&self.defaults);

        let mut candidates = self.registry.get_nodes(service).await?;
        for filter in options.filters.iter() {
            if candidates.is_empty() {
                break;
            }
            candidates = filter.apply(candidates);
        }
        if candidates.is_empty() {
            debug!("No node survived selection for {}", service);
            return Err(MeshError::NoNodeAvailable(service.to_string()));
        }

        let strategy = options.strategy.as_ref().unwrap_or(&self.fallback);
        let params = options.params.as_deref().unwrap_or(&[]);
        let node = strategy
            .select(service, &candidates, params)
            .await
            .ok_or_else(|| MeshError::NoNodeAvailable(service.to_string()))?;
        debug!("Selected {} for {}", node, service);
        Ok(node)
    }

    /// Deliver registry change events to `watcher` from a background task.
    /// Watchers never sit on the selection path.
    pub fn spawn_watch(&self, watcher: Arc<dyn Watcher>) -> JoinHandle<()> {
        let mut events = self.registry.watch();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => watcher.on_change(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Selector watcher lagged; skipped {} registry events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}
