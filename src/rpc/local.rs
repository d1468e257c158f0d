//! In-process transport
//!
//! Servers bind to an address on a shared [`LocalNetwork`]. It behaves like a
//! message broker: a call to an address nobody is bound to is accepted and
//! silently dropped, so the caller only learns about it through its timeout.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use super::message::RpcRequest;
use super::pending::PendingCalls;
use super::server::RpcServer;
use super::Transport;
use crate::error::Result;
use crate::registry::Node;

#[derive(Debug, Default)]
pub struct LocalNetwork {
    servers: DashMap<String, Arc<RpcServer>>,
    dispatched: AtomicU64,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bind(&self, address: impl Into<String>, server: Arc<RpcServer>) {
        self.servers.insert(address.into(), server);
    }

    pub fn unbind(&self, address: &str) -> bool {
        self.servers.remove(address).is_some()
    }

    /// Calls handed to the network so far, delivered or not
    pub fn dispatched(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// A transport whose replies land in `pending`
    pub fn transport(self: &Arc<Self>, pending: Arc<PendingCalls>) -> LocalTransport {
        LocalTransport {
            network: self.clone(),
            pending,
        }
    }
}

#[derive(Debug)]
pub struct LocalTransport {
    network: Arc<LocalNetwork>,
    pending: Arc<PendingCalls>,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn dispatch(&self, node: &Node, request: RpcRequest) -> Result<()> {
        self.network.dispatched.fetch_add(1, Ordering::Relaxed);

        let server = match self.network.servers.get(&node.address) {
            Some(server) => server.clone(),
            None => {
                debug!("No server bound at {}; dropping {}", node.address, request.method);
                return Ok(());
            }
        };

        let pending = self.pending.clone();
        tokio::spawn(async move {
            if let Some(reply) = server.handle(request).await {
                pending.complete(reply);
            }
        });
        Ok(())
    }
}
