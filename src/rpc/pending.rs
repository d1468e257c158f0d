//! Outstanding request/reply calls, keyed by correlation id
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use super::message::{CallId, RpcReply};

#[derive(Debug)]
pub struct PendingCalls {
    next_cid: AtomicU64,
    waiters: DashMap<CallId, oneshot::Sender<RpcReply>>,
    discarded: AtomicU64,
}

impl Default for PendingCalls {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingCalls {
    pub fn new() -> Self {
        Self {
            next_cid: AtomicU64::new(1),
            waiters: DashMap::new(),
            discarded: AtomicU64::new(0),
        }
    }

    pub fn next_cid(&self) -> CallId {
        self.next_cid.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a waiter for `cid`. Dropping the [`Waiter`] unregisters it.
    pub fn register(self: &Arc<Self>, cid: CallId) -> Waiter {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(cid, tx);
        Waiter {
            cid,
            rx,
            pending: self.clone(),
        }
    }

    /// Hand a reply to its waiter. Returns false if nobody is waiting any more
    /// (the call timed out or was never registered); the reply is discarded.
    pub fn complete(&self, reply: RpcReply) -> bool {
        let cid = reply.cid;
        let delivered = match self.waiters.remove(&cid) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        };
        if !delivered {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            debug!("Discarding late or unknown reply cid={}", cid);
        }
        delivered
    }

    /// Fail a call that can no longer be answered, e.g. because its
    /// connection dropped. A call nobody waits for is not counted as a
    /// discarded reply.
    pub fn fail(&self, cid: CallId, fault: impl Into<String>) -> bool {
        match self.waiters.remove(&cid) {
            Some((_, tx)) => tx.send(RpcReply::fault(cid, fault)).is_ok(),
            None => false,
        }
    }

    pub fn contains(&self, cid: CallId) -> bool {
        self.waiters.contains_key(&cid)
    }

    pub fn cancel(&self, cid: CallId) -> bool {
        self.waiters.remove(&cid).is_some()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Replies that arrived with no waiter
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// The receiving half of one pending call
#[derive(Debug)]
pub struct Waiter {
    cid: CallId,
    rx: oneshot::Receiver<RpcReply>,
    pending: Arc<PendingCalls>,
}

impl Waiter {
    pub fn cid(&self) -> CallId {
        self.cid
    }

    /// `None` if the sending side went away without replying
    pub async fn recv(&mut self) -> Option<RpcReply> {
        (&mut self.rx).await.ok()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.pending.cancel(self.cid);
    }
}
