mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use common::{eventually, RecordingSink, TestCluster};
use meshgate::error::MeshError;
use meshgate::gate::{GateHandler, Session, SessionState};
use meshgate::rpc::{HandlerMode, InvokeReply};
use meshgate::selector::SelectOptions;

#[tokio::test]
async fn bind_and_push_from_another_node() {
    let cluster = TestCluster::new();
    let gate_app = cluster.node("Gate@gate-1");
    let login = cluster.node("Login@login-1");
    let gate = GateHandler::install(gate_app);

    let exported = gate
        .connect("conn-1", RecordingSink::new())
        .export()
        .unwrap();

    let mut session = Session::reconstruct(login.clone(), &exported).unwrap();
    assert_eq!(session.state(), SessionState::Unbound);
    session.bind("alice").unwrap();
    session.set("room", "lobby");
    session.push().await.unwrap();

    assert_eq!(session.version(), 1);
    let owned = gate.snapshot("conn-1").unwrap();
    assert_eq!(owned.user_id, "alice");
    assert_eq!(owned.attributes.get("room").map(String::as_str), Some("lobby"));
    assert_eq!(owned.owner_node_id, "Gate@gate-1");
}

#[tokio::test]
async fn login_handler_binds_session_passed_as_argument() {
    let cluster = TestCluster::new();
    let gate_app = cluster.node("Gate@gate-1");
    let login = cluster.node("Login@login-1");
    let gate = GateHandler::install(gate_app.clone());

    let handler_app = login.clone();
    login.register("HD_Login", HandlerMode::Concurrent, move |args: Vec<Value>| {
        let app = handler_app.clone();
        async move {
            let exported = args.first().cloned().unwrap_or(Value::Null);
            let user = args.get(1).and_then(Value::as_str).unwrap_or_default().to_string();
            let mut session = match Session::reconstruct(app, &exported) {
                Ok(session) => session,
                Err(e) => return InvokeReply::err(e.to_string()),
            };
            if let Err(e) = session.bind(&user) {
                return InvokeReply::err(e.to_string());
            }
            match session.push().await {
                Ok(()) => InvokeReply::ok(json!({"user": user})),
                Err(e) => InvokeReply::err(e.to_string()),
            }
        }
    });

    let session = gate.connect("conn-1", RecordingSink::new());
    let reply = gate_app
        .invoke("Login", "HD_Login", vec![session.export().unwrap(), json!("alice")])
        .await
        .unwrap();
    assert!(!reply.is_err(), "{}", reply.error);
    assert_eq!(gate.snapshot("conn-1").unwrap().user_id, "alice");
}

#[tokio::test]
async fn send_nr_reaches_the_client() {
    let cluster = TestCluster::new();
    let gate = GateHandler::install(cluster.node("Gate@gate-1"));
    let chat = cluster.node("Chat@chat-1");

    let sink = RecordingSink::new();
    let exported = gate.connect("conn-1", sink.clone()).export().unwrap();
    let mut session = Session::reconstruct(chat, &exported).unwrap();

    session.send_nr("chat", json!({"text": "hi"})).await.unwrap();
    assert!(eventually(|| sink.messages().len() == 1).await);
    assert_eq!(sink.messages()[0], ("chat".to_string(), json!({"text": "hi"})));

    session.send("chat", json!("again")).await.unwrap();
    assert_eq!(sink.messages().len(), 2);
}

#[tokio::test]
async fn push_from_stale_copy_is_rejected() {
    let cluster = TestCluster::new();
    let gate = GateHandler::install(cluster.node("Gate@gate-1"));
    let login = cluster.node("Login@login-1");

    let exported = gate.connect("conn-1", RecordingSink::new()).export().unwrap();
    let mut first = Session::reconstruct(login.clone(), &exported).unwrap();
    let mut second = Session::reconstruct(login, &exported).unwrap();

    first.set("room", "lobby");
    first.push().await.unwrap();

    second.set("room", "arena");
    match second.push().await {
        Err(MeshError::StaleSession { version, .. }) => assert_eq!(version, 0),
        other => panic!("expected StaleSession, got {:?}", other),
    }
    assert_eq!(
        gate.snapshot("conn-1").unwrap().attributes.get("room").map(String::as_str),
        Some("lobby")
    );

    // Refreshing picks up the winner and allows another push
    second.update().await.unwrap();
    assert_eq!(second.get("room"), Some("lobby"));
    second.set("room", "arena");
    second.push().await.unwrap();
    assert_eq!(gate.snapshot("conn-1").unwrap().version, 2);
}

#[tokio::test]
async fn rebinding_through_push_is_already_bound() {
    let cluster = TestCluster::new();
    let gate = GateHandler::install(cluster.node("Gate@gate-1"));
    let login = cluster.node("Login@login-1");

    let exported = gate.connect("conn-1", RecordingSink::new()).export().unwrap();
    let mut session = Session::reconstruct(login.clone(), &exported).unwrap();
    session.bind("alice").unwrap();
    session.push().await.unwrap();

    assert!(matches!(session.bind("bob"), Err(MeshError::AlreadyBound(_))));

    let mut forged = session.export().unwrap();
    forged["Userid"] = json!("mallory");
    let mut forged = Session::reconstruct(login, &forged).unwrap();
    assert!(matches!(forged.push().await, Err(MeshError::AlreadyBound(_))));
    assert_eq!(gate.snapshot("conn-1").unwrap().user_id, "alice");
}

#[tokio::test]
async fn disconnected_client_closes_session_for_good() {
    let cluster = TestCluster::new();
    let gate = GateHandler::install(cluster.node("Gate@gate-1"));
    let chat = cluster.node("Chat@chat-1");

    let exported = gate.connect("conn-1", RecordingSink::new()).export().unwrap();
    let mut session = Session::reconstruct(chat, &exported).unwrap();
    gate.disconnect("conn-1");

    assert!(matches!(session.push().await, Err(MeshError::SessionClosed(_))));
    assert_eq!(session.state(), SessionState::Closed);

    // Later operations fail without touching the network
    let before = cluster.network.dispatched();
    assert!(matches!(
        session.send_nr("chat", json!("hi")).await,
        Err(MeshError::SessionClosed(_))
    ));
    assert!(matches!(session.update().await, Err(MeshError::SessionClosed(_))));
    assert!(matches!(session.close().await, Err(MeshError::SessionClosed(_))));
    assert_eq!(cluster.network.dispatched(), before);
}

#[tokio::test]
async fn owner_leaving_the_registry_closes_session() {
    let cluster = TestCluster::new();
    let gate = GateHandler::install(cluster.node("Gate@gate-1"));
    let chat = cluster.node("Chat@chat-1");

    let exported = gate.connect("conn-1", RecordingSink::new()).export().unwrap();
    let mut session = Session::reconstruct(chat, &exported).unwrap();
    cluster.registry.deregister("Gate@gate-1");

    assert!(matches!(
        session.send("chat", json!("hi")).await,
        Err(MeshError::SessionClosed(_))
    ));
    assert!(session.is_closed());
}

#[tokio::test]
async fn close_drops_the_connection_at_the_gate() {
    let cluster = TestCluster::new();
    let gate = GateHandler::install(cluster.node("Gate@gate-1"));
    let chat = cluster.node("Chat@chat-1");

    let exported = gate.connect("conn-1", RecordingSink::new()).export().unwrap();
    let mut session = Session::reconstruct(chat, &exported).unwrap();
    session.close().await.unwrap();

    assert!(session.is_closed());
    assert_eq!(gate.connection_count(), 0);
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let cluster = TestCluster::new();
    let gate = GateHandler::install(cluster.node("Gate@gate-1"));
    let chat = cluster.node("Chat@chat-1");

    let sinks: Vec<Arc<RecordingSink>> = (0..3).map(|_| RecordingSink::new()).collect();
    for (i, sink) in sinks.iter().enumerate() {
        gate.connect(&format!("conn-{}", i), sink.clone());
    }

    let reply = chat
        .invoke_node("Gate@gate-1", "Broadcast", vec![json!("notice"), json!("maintenance")], None)
        .await
        .unwrap();
    assert_eq!(reply.result, json!(3));
    assert!(sinks.iter().all(|sink| sink.messages().len() == 1));
}

#[tokio::test]
async fn serial_handler_on_gate_pushes_session_it_owns() {
    let cluster = TestCluster::new();
    let gate_app = cluster.node_with("Gate@gate-1", Duration::from_secs(1), SelectOptions::default());
    let chat = cluster.node("Chat@chat-1");
    let gate = GateHandler::install(gate_app.clone());

    let handler_app = gate_app.clone();
    gate_app.register("HD_SetRoom", HandlerMode::serial("Gate"), move |args: Vec<Value>| {
        let app = handler_app.clone();
        async move {
            let exported = args.first().cloned().unwrap_or(Value::Null);
            let mut session = match Session::reconstruct(app, &exported) {
                Ok(session) => session,
                Err(e) => return InvokeReply::err(e.to_string()),
            };
            session.set("room", "lobby");
            match session.push().await.and_then(|_| session.export()) {
                Ok(snapshot) => InvokeReply::ok(snapshot),
                Err(e) => InvokeReply::err(e.to_string()),
            }
        }
    });

    let exported = gate.connect("conn-1", RecordingSink::new()).export().unwrap();
    let reply = chat
        .invoke_node("Gate@gate-1", "HD_SetRoom", vec![exported], None)
        .await
        .unwrap();
    assert_eq!(reply.error, "");
    assert_eq!(reply.result["Settings"], json!({"room": "lobby"}));
    assert_eq!(reply.result["Version"], json!(1));
    assert_eq!(
        gate.snapshot("conn-1").unwrap().attributes.get("room").map(String::as_str),
        Some("lobby")
    );
}

#[tokio::test]
async fn remote_set_and_remove_apply_at_the_owner() {
    let cluster = TestCluster::new();
    let gate = GateHandler::install(cluster.node("Gate@gate-1"));
    let chat = cluster.node("Chat@chat-1");

    let exported = gate.connect("conn-1", RecordingSink::new()).export().unwrap();
    let mut session = Session::reconstruct(chat, &exported).unwrap();

    session.set_remote("room", "lobby").await.unwrap();
    assert_eq!(session.get("room"), Some("lobby"));
    assert_eq!(session.version(), 1);

    session.set_push("seat", "3").await.unwrap();
    assert_eq!(session.version(), 2);

    session.remove_remote("room").await.unwrap();
    assert_eq!(session.get("room"), None);

    let owned = gate.snapshot("conn-1").unwrap();
    assert_eq!(owned.version, 3);
    assert_eq!(owned.attributes.get("seat").map(String::as_str), Some("3"));
    assert!(!owned.attributes.contains_key("room"));

    gate.disconnect("conn-1");
    assert!(matches!(
        session.set_remote("room", "arena").await,
        Err(MeshError::SessionClosed(_))
    ));
}

#[tokio::test]
async fn is_connect_and_send_batch_through_a_session() {
    let cluster = TestCluster::new();
    let gate = GateHandler::install(cluster.node("Gate@gate-1"));
    let chat = cluster.node("Chat@chat-1");

    let alice_sink = RecordingSink::new();
    let bob_sink = RecordingSink::new();
    let exported = gate.connect("conn-1", alice_sink.clone()).export().unwrap();
    gate.connect("conn-2", bob_sink.clone());

    let mut session = Session::reconstruct(chat, &exported).unwrap();
    assert!(!session.is_connect("alice").await.unwrap());
    session.bind("alice").unwrap();
    session.push().await.unwrap();
    assert!(session.is_connect("alice").await.unwrap());

    let delivered = session
        .send_batch(&["conn-1", "conn-2", "conn-gone"], "chat", json!("hi all"))
        .await
        .unwrap();
    assert_eq!(delivered, 2);
    assert_eq!(alice_sink.messages().len(), 1);
    assert_eq!(bob_sink.messages().len(), 1);
}
