//! Node-to-node call machinery
//!
//! [`RpcClient`] registers a waiter per request/reply call and hands the
//! request to a [`Transport`]. The transport delivers replies into the same
//! [`PendingCalls`] table. On the far side an [`RpcServer`] runs the method.
use async_trait::async_trait;

use crate::error::Result;
use crate::registry::Node;

pub mod client;
pub mod codec;
pub mod local;
pub mod message;
pub mod pending;
pub mod server;
pub mod tcp;

pub use client::RpcClient;
pub use local::{LocalNetwork, LocalTransport};
pub use message::{CallId, InvokeReply, RpcReply, RpcRequest};
pub use pending::PendingCalls;
pub use server::{HandlerMode, RpcHandler, RpcServer};
pub use tcp::{TcpRpcListener, TcpTransport};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand `request` to `node`. Returns once the request is dispatched, not
    /// once it is handled.
    async fn dispatch(&self, node: &Node, request: RpcRequest) -> Result<()>;
}
