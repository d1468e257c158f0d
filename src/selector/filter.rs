//! Node filters
//!
//! Filters are pure and synchronous. They run in chain order, each one seeing
//! the survivors of the one before it.
use std::collections::HashSet;

use crate::registry::Node;

pub trait Filter: Send + Sync {
    fn apply(&self, nodes: Vec<Node>) -> Vec<Node>;
}

impl<F> Filter for F
where
    F: Fn(Vec<Node>) -> Vec<Node> + Send + Sync,
{
    fn apply(&self, nodes: Vec<Node>) -> Vec<Node> {
        self(nodes)
    }
}

/// Keep nodes whose metadata has `key` set to `value`
#[derive(Clone, Debug)]
pub struct MetadataFilter {
    key: String,
    value: String,
}

impl MetadataFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Filter for MetadataFilter {
    fn apply(&self, nodes: Vec<Node>) -> Vec<Node> {
        nodes
            .into_iter()
            .filter(|node| node.metadata(&self.key) == Some(self.value.as_str()))
            .collect()
    }
}

/// Drop the listed node ids
#[derive(Clone, Debug, Default)]
pub struct ExcludeFilter {
    ids: HashSet<String>,
}

impl ExcludeFilter {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl Filter for ExcludeFilter {
    fn apply(&self, nodes: Vec<Node>) -> Vec<Node> {
        nodes
            .into_iter()
            .filter(|node| !self.ids.contains(&node.id))
            .collect()
    }
}
