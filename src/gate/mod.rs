//! Gate: the owner side of client sessions
//!
//! A gate node holds the live client connections. Its [`GateHandler`] keeps
//! the authoritative snapshot of every connection's session and exposes the
//! methods other nodes use through their [`Session`] handles.
//!
//! Every method is concurrent. Snapshot changes are applied under the
//! connection table lock, so a handler on this node can push a session it
//! owns without queueing behind itself.
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::app::App;
use crate::error::Result;
use crate::rpc::{HandlerMode, InvokeReply, RpcHandler};

pub mod session;

pub use session::{Session, SessionSnapshot, SessionState};

pub const METHOD_PUSH: &str = "Push";
pub const METHOD_SEND: &str = "Send";
pub const METHOD_UPDATE: &str = "Update";
pub const METHOD_CLOSE: &str = "Close";
pub const METHOD_BROADCAST: &str = "Broadcast";
pub const METHOD_SEND_BATCH: &str = "SendBatch";
pub const METHOD_IS_CONNECT: &str = "IsConnect";
pub const METHOD_SET: &str = "Set";
pub const METHOD_REMOVE: &str = "Remove";

pub const ERR_NO_SESSION: &str = "No Session found";
pub const ERR_STALE_SESSION: &str = "Stale session version";
pub const ERR_USER_BOUND: &str = "User id already bound";
pub const ERR_GATE_STOPPED: &str = "Gate stopped";

const EVENT_CAPACITY: usize = 256;

/// Writes to one client's socket
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send(&self, topic: &str, payload: &Value) -> Result<()>;
    async fn close(&self);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GateEvent {
    Connected(SessionSnapshot),
    Disconnected(SessionSnapshot),
}

struct Connection {
    snapshot: SessionSnapshot,
    sink: Arc<dyn ClientSink>,
}

pub struct GateHandler {
    app: App,
    connections: Mutex<HashMap<String, Connection>>,
    events: broadcast::Sender<GateEvent>,
}

impl std::fmt::Debug for GateHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GateHandler")
            .field("node", &self.app.node_id())
            .field("connections", &self.connection_count())
            .finish()
    }
}

fn string_arg(args: &[Value], index: usize) -> Option<&str> {
    args.get(index).and_then(Value::as_str)
}

/// A list of connection ids: a JSON array of strings, or one comma-separated
/// string
fn connection_ids(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_str().map(str::to_string))
            .collect(),
        Value::String(joined) => Some(
            joined
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        _ => None,
    }
}

/// Write to every sink at once. Returns how many accepted the message.
async fn fan_out(targets: Vec<(String, Arc<dyn ClientSink>)>, topic: &str, payload: &Value) -> u64 {
    let mut sends = JoinSet::new();
    for (connection_id, sink) in targets {
        let topic = topic.to_string();
        let payload = payload.clone();
        sends.spawn(async move {
            match sink.send(&topic, &payload).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Write to client {} failed: {}", connection_id, e);
                    false
                }
            }
        });
    }

    let mut delivered = 0u64;
    while let Some(sent) = sends.join_next().await {
        if matches!(sent, Ok(true)) {
            delivered += 1;
        }
    }
    delivered
}

/// Wrap a gate method as an RPC handler. The server only holds a weak
/// reference so the gate and its app can be dropped together.
fn gate_method<F, Fut>(gate: &Arc<GateHandler>, method: F) -> impl RpcHandler
where
    F: Fn(Arc<GateHandler>, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = InvokeReply> + Send + 'static,
{
    let weak: Weak<GateHandler> = Arc::downgrade(gate);
    move |args: Vec<Value>| {
        let call = weak.upgrade().map(|gate| method(gate, args));
        async move {
            match call {
                Some(call) => call.await,
                None => InvokeReply::err(ERR_GATE_STOPPED),
            }
        }
    }
}

impl GateHandler {
    /// Create the handler and register its methods on the app's server
    pub fn install(app: App) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let gate = Arc::new(Self {
            app: app.clone(),
            connections: Mutex::new(HashMap::new()),
            events,
        });

        app.register(
            METHOD_PUSH,
            HandlerMode::Concurrent,
            gate_method(&gate, |gate, args| async move { gate.on_push(&args) }),
        );
        app.register(
            METHOD_SET,
            HandlerMode::Concurrent,
            gate_method(&gate, |gate, args| async move { gate.on_set(&args) }),
        );
        app.register(
            METHOD_REMOVE,
            HandlerMode::Concurrent,
            gate_method(&gate, |gate, args| async move { gate.on_remove(&args) }),
        );
        app.register(
            METHOD_IS_CONNECT,
            HandlerMode::Concurrent,
            gate_method(&gate, |gate, args| async move { gate.on_is_connect(&args) }),
        );
        app.register(
            METHOD_SEND_BATCH,
            HandlerMode::Concurrent,
            gate_method(&gate, |gate, args| async move { gate.on_send_batch(&args).await }),
        );
        app.register(
            METHOD_UPDATE,
            HandlerMode::Concurrent,
            gate_method(&gate, |gate, args| async move { gate.on_update(&args) }),
        );
        app.register(
            METHOD_SEND,
            HandlerMode::Concurrent,
            gate_method(&gate, |gate, args| async move { gate.on_send(&args).await }),
        );
        app.register(
            METHOD_CLOSE,
            HandlerMode::Concurrent,
            gate_method(&gate, |gate, args| async move { gate.on_close(&args).await }),
        );
        app.register(
            METHOD_BROADCAST,
            HandlerMode::Concurrent,
            gate_method(&gate, |gate, args| async move { gate.on_broadcast(&args).await }),
        );

        info!("Gate handler installed on {}", app.node_id());
        gate
    }

    /// A client connected. Returns its fresh, unbound session.
    pub fn connect(&self, connection_id: &str, sink: Arc<dyn ClientSink>) -> Session {
        let session = Session::create(self.app.clone(), connection_id, self.app.node_id());
        let snapshot = session.snapshot().clone();
        self.lock().insert(
            connection_id.to_string(),
            Connection {
                snapshot: snapshot.clone(),
                sink,
            },
        );
        debug!("Client {} connected", connection_id);
        let _ = self.events.send(GateEvent::Connected(snapshot));
        session
    }

    /// The client's socket is gone
    pub fn disconnect(&self, connection_id: &str) -> Option<SessionSnapshot> {
        let removed = self.lock().remove(connection_id)?;
        debug!("Client {} disconnected", connection_id);
        let _ = self
            .events
            .send(GateEvent::Disconnected(removed.snapshot.clone()));
        Some(removed.snapshot)
    }

    /// The authoritative snapshot for a live connection
    pub fn snapshot(&self, connection_id: &str) -> Option<SessionSnapshot> {
        self.lock()
            .get(connection_id)
            .map(|conn| conn.snapshot.clone())
    }

    /// A handle on a live connection's session
    pub fn session(&self, connection_id: &str) -> Option<Session> {
        let snapshot = self.snapshot(connection_id)?;
        let exported = snapshot.to_value().ok()?;
        Session::reconstruct(self.app.clone(), &exported).ok()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GateEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Connection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sink(&self, connection_id: &str) -> Option<Arc<dyn ClientSink>> {
        self.lock().get(connection_id).map(|conn| conn.sink.clone())
    }

    /// Args: `[snapshot]`. Applies the pushed snapshot if its version matches
    /// and it does not rebind the user. Replies with the new snapshot.
    pub fn on_push(&self, args: &[Value]) -> InvokeReply {
        let pushed = match args.first().map(SessionSnapshot::from_value) {
            Some(Ok(pushed)) => pushed,
            Some(Err(e)) => return InvokeReply::err(e.to_string()),
            None => return InvokeReply::err("missing session"),
        };

        let mut connections = self.lock();
        let conn = match connections.get_mut(&pushed.connection_id) {
            Some(conn) => conn,
            None => return InvokeReply::err(ERR_NO_SESSION),
        };
        if pushed.version != conn.snapshot.version {
            debug!(
                "Rejecting stale push for {} (pushed v{}, current v{})",
                pushed.connection_id, pushed.version, conn.snapshot.version
            );
            return InvokeReply::err(ERR_STALE_SESSION);
        }
        if !conn.snapshot.user_id.is_empty() && pushed.user_id != conn.snapshot.user_id {
            warn!(
                "Rejecting push rebinding {} from {} to {}",
                pushed.connection_id, conn.snapshot.user_id, pushed.user_id
            );
            return InvokeReply::err(ERR_USER_BOUND);
        }

        conn.snapshot = SessionSnapshot {
            owner_node_id: conn.snapshot.owner_node_id.clone(),
            version: conn.snapshot.version + 1,
            ..pushed
        };
        match conn.snapshot.to_value() {
            Ok(value) => InvokeReply::ok(value),
            Err(e) => InvokeReply::err(e.to_string()),
        }
    }

    /// Apply `change` to a live snapshot and bump its version. Replies with the
    /// new snapshot.
    fn modify(&self, connection_id: &str, change: impl FnOnce(&mut SessionSnapshot)) -> InvokeReply {
        let mut connections = self.lock();
        let conn = match connections.get_mut(connection_id) {
            Some(conn) => conn,
            None => return InvokeReply::err(ERR_NO_SESSION),
        };
        change(&mut conn.snapshot);
        conn.snapshot.version += 1;
        match conn.snapshot.to_value() {
            Ok(value) => InvokeReply::ok(value),
            Err(e) => InvokeReply::err(e.to_string()),
        }
    }

    /// Args: `[connection_id, key, value]`
    pub fn on_set(&self, args: &[Value]) -> InvokeReply {
        match (string_arg(args, 0), string_arg(args, 1), string_arg(args, 2)) {
            (Some(connection_id), Some(key), Some(value)) => self.modify(connection_id, |snapshot| {
                snapshot.attributes.insert(key.to_string(), value.to_string());
            }),
            _ => InvokeReply::err("expected connection id, key and value"),
        }
    }

    /// Args: `[connection_id, key]`
    pub fn on_remove(&self, args: &[Value]) -> InvokeReply {
        match (string_arg(args, 0), string_arg(args, 1)) {
            (Some(connection_id), Some(key)) => self.modify(connection_id, |snapshot| {
                snapshot.attributes.remove(key);
            }),
            _ => InvokeReply::err("expected connection id and key"),
        }
    }

    /// Args: `[user_id]`. Only this gate's connections are checked.
    pub fn on_is_connect(&self, args: &[Value]) -> InvokeReply {
        let user_id = match string_arg(args, 0) {
            Some(id) if !id.is_empty() => id,
            _ => return InvokeReply::err("missing user id"),
        };
        let connected = self
            .lock()
            .values()
            .any(|conn| conn.snapshot.user_id == user_id);
        InvokeReply::ok(connected)
    }

    /// Args: `[connection_id]`
    pub fn on_update(&self, args: &[Value]) -> InvokeReply {
        let connection_id = match string_arg(args, 0) {
            Some(id) => id,
            None => return InvokeReply::err("missing connection id"),
        };
        match self.snapshot(connection_id).map(|s| s.to_value()) {
            Some(Ok(value)) => InvokeReply::ok(value),
            Some(Err(e)) => InvokeReply::err(e.to_string()),
            None => InvokeReply::err(ERR_NO_SESSION),
        }
    }

    /// Args: `[connection_id, topic, payload]`
    pub async fn on_send(&self, args: &[Value]) -> InvokeReply {
        let (connection_id, topic) = match (string_arg(args, 0), string_arg(args, 1)) {
            (Some(id), Some(topic)) => (id, topic),
            _ => return InvokeReply::err("expected connection id and topic"),
        };
        let payload = args.get(2).cloned().unwrap_or(Value::Null);
        let sink = match self.sink(connection_id) {
            Some(sink) => sink,
            None => return InvokeReply::err(ERR_NO_SESSION),
        };
        match sink.send(topic, &payload).await {
            Ok(()) => InvokeReply::ok(true),
            Err(e) => {
                warn!("Write to client {} failed: {}", connection_id, e);
                InvokeReply::err(e.to_string())
            }
        }
    }

    /// Args: `[connection_id]`
    pub async fn on_close(&self, args: &[Value]) -> InvokeReply {
        let connection_id = match string_arg(args, 0) {
            Some(id) => id,
            None => return InvokeReply::err("missing connection id"),
        };
        let sink = match self.sink(connection_id) {
            Some(sink) => sink,
            None => return InvokeReply::err(ERR_NO_SESSION),
        };
        sink.close().await;
        self.disconnect(connection_id);
        InvokeReply::ok(true)
    }

    /// Args: `[connection_ids, topic, payload]`. Unknown ids are skipped.
    /// Replies with the number of clients written to.
    pub async fn on_send_batch(&self, args: &[Value]) -> InvokeReply {
        let (ids, topic) = match (args.first().and_then(connection_ids), string_arg(args, 1)) {
            (Some(ids), Some(topic)) => (ids, topic),
            _ => return InvokeReply::err("expected connection ids and topic"),
        };
        let payload = args.get(2).cloned().unwrap_or(Value::Null);
        let sinks: Vec<(String, Arc<dyn ClientSink>)> = {
            let connections = self.lock();
            ids.into_iter()
                .filter_map(|id| connections.get(&id).map(|conn| (id.clone(), conn.sink.clone())))
                .collect()
        };
        InvokeReply::ok(json!(fan_out(sinks, topic, &payload).await))
    }

    /// Args: `[topic, payload]`. Replies with the number of clients written to.
    pub async fn on_broadcast(&self, args: &[Value]) -> InvokeReply {
        let topic = match string_arg(args, 0) {
            Some(topic) => topic,
            None => return InvokeReply::err("missing topic"),
        };
        let payload = args.get(1).cloned().unwrap_or(Value::Null);
        let sinks: Vec<(String, Arc<dyn ClientSink>)> = self
            .lock()
            .iter()
            .map(|(id, conn)| (id.clone(), conn.sink.clone()))
            .collect();
        InvokeReply::ok(json!(fan_out(sinks, topic, &payload).await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records everything written to one client
    #[derive(Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<(String, Value)>>,
        pub closed: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        pub fn messages(&self) -> Vec<(String, Value)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ClientSink for RecordingSink {
        async fn send(&self, topic: &str, payload: &Value) -> Result<()> {
            self.sent
                .lock()
                .unwrap()
                .push((topic.to_string(), payload.clone()));
            Ok(())
        }

        async fn close(&self) {
            self.closed
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn gate() -> Arc<GateHandler> {
        let app = crate::app::tests::local_app(
            "Gate@gate-1",
            Arc::new(crate::registry::StaticRegistry::new()),
            crate::rpc::LocalNetwork::new(),
        );
        GateHandler::install(app)
    }

    #[tokio::test]
    async fn test_install_registers_methods() {
        let gate = gate();
        assert_eq!(
            gate.app.server().methods(),
            vec![
                "Broadcast",
                "Close",
                "IsConnect",
                "Push",
                "Remove",
                "Send",
                "SendBatch",
                "Set",
                "Update"
            ]
        );
    }

    #[tokio::test]
    async fn test_push_checks_version() {
        let gate = gate();
        let session = gate.connect("conn-1", Arc::new(RecordingSink::default()));
        let mut pushed = session.snapshot().clone();
        pushed.user_id = "alice".to_string();

        let reply = gate.on_push(&[pushed.to_value().unwrap()]);
        assert!(!reply.is_err());
        assert_eq!(gate.snapshot("conn-1").unwrap().version, 1);
        assert_eq!(gate.snapshot("conn-1").unwrap().user_id, "alice");

        // Same base version again is now stale
        let reply = gate.on_push(&[pushed.to_value().unwrap()]);
        assert_eq!(reply.error, ERR_STALE_SESSION);
    }

    #[tokio::test]
    async fn test_push_cannot_rebind_user() {
        let gate = gate();
        gate.connect("conn-1", Arc::new(RecordingSink::default()));
        let mut first = gate.snapshot("conn-1").unwrap();
        first.user_id = "alice".to_string();
        assert!(!gate.on_push(&[first.to_value().unwrap()]).is_err());

        let mut second = gate.snapshot("conn-1").unwrap();
        second.user_id = "mallory".to_string();
        assert_eq!(gate.on_push(&[second.to_value().unwrap()]).error, ERR_USER_BOUND);
        assert_eq!(gate.snapshot("conn-1").unwrap().user_id, "alice");
    }

    #[tokio::test]
    async fn test_push_ignores_owner_rewrites() {
        let gate = gate();
        gate.connect("conn-1", Arc::new(RecordingSink::default()));
        let mut pushed = gate.snapshot("conn-1").unwrap();
        pushed.owner_node_id = "Gate@elsewhere".to_string();
        gate.on_push(&[pushed.to_value().unwrap()]);
        assert_eq!(gate.snapshot("conn-1").unwrap().owner_node_id, "Gate@gate-1");
    }

    #[tokio::test]
    async fn test_send_and_broadcast_reach_sinks() {
        let gate = gate();
        let one = Arc::new(RecordingSink::default());
        let two = Arc::new(RecordingSink::default());
        gate.connect("conn-1", one.clone());
        gate.connect("conn-2", two.clone());

        let reply = gate
            .on_send(&[json!("conn-1"), json!("chat"), json!({"text": "hi"})])
            .await;
        assert!(!reply.is_err());
        assert_eq!(one.messages(), vec![("chat".to_string(), json!({"text": "hi"}))]);

        let reply = gate.on_broadcast(&[json!("notice"), json!("bye")]).await;
        assert_eq!(reply.result, json!(2));
        assert_eq!(two.messages().len(), 1);

        let reply = gate.on_send(&[json!("conn-9"), json!("chat"), json!(1)]).await;
        assert_eq!(reply.error, ERR_NO_SESSION);
    }

    #[tokio::test]
    async fn test_close_and_disconnect() {
        let gate = gate();
        let sink = Arc::new(RecordingSink::default());
        gate.connect("conn-1", sink.clone());
        let mut events = gate.subscribe();

        assert!(!gate.on_close(&[json!("conn-1")]).await.is_err());
        assert!(sink.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(gate.connection_count(), 0);
        assert!(matches!(events.recv().await.unwrap(), GateEvent::Disconnected(_)));

        assert_eq!(gate.on_update(&[json!("conn-1")]).error, ERR_NO_SESSION);
        assert!(gate.disconnect("conn-1").is_none());
    }

    #[tokio::test]
    async fn test_set_and_remove_bump_version() {
        let gate = gate();
        gate.connect("conn-1", Arc::new(RecordingSink::default()));

        let reply = gate.on_set(&[json!("conn-1"), json!("room"), json!("lobby")]);
        assert_eq!(reply.result["Settings"], json!({"room": "lobby"}));
        assert_eq!(reply.result["Version"], json!(1));

        let reply = gate.on_remove(&[json!("conn-1"), json!("room")]);
        assert_eq!(reply.result["Settings"], json!({}));
        assert_eq!(gate.snapshot("conn-1").unwrap().version, 2);

        assert_eq!(
            gate.on_set(&[json!("conn-9"), json!("room"), json!("lobby")]).error,
            ERR_NO_SESSION
        );
        assert!(gate.on_remove(&[json!("conn-1")]).is_err());
    }

    #[tokio::test]
    async fn test_is_connect_looks_up_bound_users() {
        let gate = gate();
        gate.connect("conn-1", Arc::new(RecordingSink::default()));
        let mut bound = gate.snapshot("conn-1").unwrap();
        bound.user_id = "alice".to_string();
        gate.on_push(&[bound.to_value().unwrap()]);

        assert_eq!(gate.on_is_connect(&[json!("alice")]).result, json!(true));
        assert_eq!(gate.on_is_connect(&[json!("bob")]).result, json!(false));
        assert!(gate.on_is_connect(&[]).is_err());

        gate.disconnect("conn-1");
        assert_eq!(gate.on_is_connect(&[json!("alice")]).result, json!(false));
    }

    #[tokio::test]
    async fn test_send_batch_skips_unknown_connections() {
        let gate = gate();
        let one = Arc::new(RecordingSink::default());
        let two = Arc::new(RecordingSink::default());
        let three = Arc::new(RecordingSink::default());
        gate.connect("conn-1", one.clone());
        gate.connect("conn-2", two.clone());
        gate.connect("conn-3", three.clone());

        let reply = gate
            .on_send_batch(&[json!(["conn-1", "conn-3", "conn-9"]), json!("chat"), json!("hi")])
            .await;
        assert_eq!(reply.result, json!(2));
        assert_eq!(one.messages().len(), 1);
        assert!(two.messages().is_empty());
        assert_eq!(three.messages().len(), 1);

        let reply = gate
            .on_send_batch(&[json!("conn-2, conn-3"), json!("chat"), json!("again")])
            .await;
        assert_eq!(reply.result, json!(2));
        assert_eq!(two.messages().len(), 1);

        assert!(gate.on_send_batch(&[json!(42), json!("chat")]).await.is_err());
    }

    /// A client whose socket takes a while to accept each write
    struct SlowSink(std::time::Duration);

    #[async_trait]
    impl ClientSink for SlowSink {
        async fn send(&self, _topic: &str, _payload: &Value) -> Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }

        async fn close(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_does_not_wait_on_slow_client() {
        let gate = gate();
        let fast: Vec<Arc<RecordingSink>> = (0..3).map(|_| Arc::new(RecordingSink::default())).collect();
        gate.connect("slow", Arc::new(SlowSink(std::time::Duration::from_secs(30))));
        for (i, sink) in fast.iter().enumerate() {
            gate.connect(&format!("conn-{}", i), sink.clone());
        }

        let broadcast = tokio::spawn({
            let gate = gate.clone();
            async move { gate.on_broadcast(&[json!("notice"), json!("bye")]).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(fast.iter().all(|sink| sink.messages().len() == 1));
        assert!(!broadcast.is_finished());

        assert_eq!(broadcast.await.unwrap().result, json!(4));
    }
}
