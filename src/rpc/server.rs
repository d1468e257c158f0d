//! Dispatch side of node-to-node calls
//!
//! Each method is registered with a [`HandlerMode`]. Serial handlers take
//! turns per queue: a module registers its serial methods under its own queue
//! name, so the state it touches has one writer at a time while other modules
//! on the same node keep running. Concurrent handlers run as independent tasks.
//!
//! A serial handler must not wait on a call into its own queue on the same
//! node. That call queues behind the caller and can only end in a timeout.
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, warn};

use super::message::{now_millis, InvokeReply, RpcReply, RpcRequest};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerMode {
    /// One at a time among the handlers sharing the named queue
    Serial(String),
    /// Each call on its own task
    Concurrent,
}

impl HandlerMode {
    pub fn serial(queue: impl Into<String>) -> Self {
        HandlerMode::Serial(queue.into())
    }
}

#[async_trait]
pub trait RpcHandler: Send + Sync + 'static {
    async fn call(&self, args: Vec<Value>) -> InvokeReply;
}

#[async_trait]
impl<F, Fut> RpcHandler for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InvokeReply> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>) -> InvokeReply {
        self(args).await
    }
}

struct Registration {
    handler: Arc<dyn RpcHandler>,
    mode: HandlerMode,
}

/// Decrements the executing counter on every exit path
struct ExecutingGuard<'a>(&'a AtomicI64);

impl<'a> ExecutingGuard<'a> {
    fn enter(counter: &'a AtomicI64) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for ExecutingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct RpcServer {
    node_id: String,
    handlers: RwLock<HashMap<String, Arc<Registration>>>,
    serial_queues: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    executing: Arc<AtomicI64>,
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("node_id", &self.node_id)
            .field("methods", &self.methods())
            .field("executing", &self.executing())
            .finish()
    }
}

impl RpcServer {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            handlers: RwLock::new(HashMap::new()),
            serial_queues: DashMap::new(),
            executing: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register (or replace) the handler for `method`
    pub fn register(&self, method: impl Into<String>, mode: HandlerMode, handler: impl RpcHandler) {
        let method = method.into();
        debug!("{} registering {} ({:?})", self.node_id, method, mode);
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                method,
                Arc::new(Registration {
                    handler: Arc::new(handler),
                    mode,
                }),
            );
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        methods.sort();
        methods
    }

    /// Calls currently running; published as this node's load
    pub fn executing(&self) -> i64 {
        self.executing.load(Ordering::Relaxed)
    }

    pub fn executing_counter(&self) -> Arc<AtomicI64> {
        self.executing.clone()
    }

    fn serial_queue(&self, queue: &str) -> Arc<tokio::sync::Mutex<()>> {
        if let Some(lock) = self.serial_queues.get(queue) {
            return lock.clone();
        }
        self.serial_queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Run one inbound call. Returns the reply to send back, or `None` for
    /// fire-and-forget and expired calls.
    pub async fn handle(&self, request: RpcRequest) -> Option<RpcReply> {
        if request.is_expired(now_millis()) {
            warn!(
                "{} dropping expired call {} cid={}",
                self.node_id, request.method, request.cid
            );
            return None;
        }

        let registration = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.method)
            .cloned();

        let outcome = match registration {
            Some(registration) => self.run(registration, request.args).await,
            None => Err(format!("method not found: {}", request.method)),
        };

        if !request.reply {
            if let Err(fault) = outcome {
                warn!("{} fire-and-forget {} failed: {}", self.node_id, request.method, fault);
            }
            return None;
        }

        Some(match outcome {
            Ok(body) => RpcReply::completed(request.cid, body),
            Err(fault) => RpcReply::fault(request.cid, fault),
        })
    }

    async fn run(
        &self,
        registration: Arc<Registration>,
        args: Vec<Value>,
    ) -> std::result::Result<InvokeReply, String> {
        let handler = registration.handler.clone();
        // Spawned so a panicking handler surfaces as a JoinError
        let task = async move { tokio::spawn(async move { handler.call(args).await }).await };

        let joined = match &registration.mode {
            HandlerMode::Serial(queue) => {
                let lock = self.serial_queue(queue);
                let _turn = lock.lock().await;
                let _executing = ExecutingGuard::enter(&self.executing);
                task.await
            }
            HandlerMode::Concurrent => {
                let _executing = ExecutingGuard::enter(&self.executing);
                task.await
            }
        };

        joined.map_err(|e| {
            if e.is_panic() {
                "handler panicked".to_string()
            } else {
                "handler cancelled".to_string()
            }
        })
    }
}
