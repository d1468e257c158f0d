//! Calling side of node-to-node calls
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::message::{now_millis, InvokeReply, RpcReply, RpcRequest};
use super::pending::PendingCalls;
use super::Transport;
use crate::error::{MeshError, Result};
use crate::registry::Node;

pub struct RpcClient {
    transport: Arc<dyn Transport>,
    pending: Arc<PendingCalls>,
    default_timeout: Duration,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("pending", &self.pending.len())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl RpcClient {
    /// `pending` must be the table the transport delivers replies into
    pub fn new(
        transport: Arc<dyn Transport>,
        pending: Arc<PendingCalls>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            pending,
            default_timeout,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn pending(&self) -> &Arc<PendingCalls> {
        &self.pending
    }

    /// Request/reply call to a known node. Suspends only the calling task,
    /// until the reply arrives or `timeout` (default: the client's) elapses.
    #[instrument(skip(self, node, args), fields(node = %node.id))]
    pub async fn call(
        &self,
        node: &Node,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<InvokeReply> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let cid = self.pending.next_cid();
        // Unregisters on every exit path, including the caller dropping us
        let mut waiter = self.pending.register(cid);

        let request = RpcRequest {
            cid,
            method: method.to_string(),
            args,
            reply: true,
            expires_at_ms: deadline_millis(now_millis(), timeout),
        };
        self.transport.dispatch(node, request).await?;

        match tokio::time::timeout(timeout, waiter.recv()).await {
            Ok(Some(reply)) => into_invoke_reply(method, reply),
            Ok(None) => Err(MeshError::Transport(format!(
                "{} reply channel closed",
                method
            ))),
            Err(_) => {
                warn!("Call to {} cid={} timed out after {:?}", method, cid, timeout);
                Err(MeshError::Timeout {
                    method: method.to_string(),
                    after: timeout,
                })
            }
        }
    }

    /// Fire-and-forget: returns once the request is handed to the transport
    pub async fn call_nr(&self, node: &Node, method: &str, args: Vec<Value>) -> Result<()> {
        let request = RpcRequest {
            cid: 0,
            method: method.to_string(),
            args,
            reply: false,
            expires_at_ms: deadline_millis(now_millis(), self.default_timeout),
        };
        debug!("Dispatching {} to {} (no reply)", method, node);
        self.transport.dispatch(node, request).await
    }
}

/// Wall-clock expiry for a call sent at `now`; saturates instead of wrapping
fn deadline_millis(now: i64, timeout: Duration) -> i64 {
    let timeout = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    now.saturating_add(timeout)
}

fn into_invoke_reply(method: &str, reply: RpcReply) -> Result<InvokeReply> {
    match reply.fault {
        Some(fault) => Err(MeshError::Transport(format!("{} failed: {}", method, fault))),
        None => Ok(reply.body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deadline_saturates() {
        assert_eq!(deadline_millis(1_000, Duration::from_millis(500)), 1_500);
        assert_eq!(deadline_millis(1_000, Duration::MAX), i64::MAX);
        assert_eq!(
            deadline_millis(i64::MAX - 10, Duration::from_secs(1)),
            i64::MAX
        );
    }

    #[test]
    fn test_fault_becomes_transport_error() {
        let err = into_invoke_reply("Nope", RpcReply::fault(1, "method not found: Nope"))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Transport error: Nope failed: method not found: Nope"
        );

        let ok = into_invoke_reply("HD_Login", RpcReply::completed(2, InvokeReply::err("denied")))
            .unwrap();
        assert_eq!(ok.error, "denied");
    }
}
