//! Portable client sessions
//!
//! A [`Session`] is a handle on a client connection owned by some gate node.
//! It holds only identifiers and attributes, so it can be exported into RPC
//! arguments and rebuilt on any node. Local changes stay local until
//! [`Session::push`] sends them to the owner.
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::{ERR_NO_SESSION, ERR_STALE_SESSION, ERR_USER_BOUND};
use super::{
    METHOD_CLOSE, METHOD_IS_CONNECT, METHOD_PUSH, METHOD_REMOVE, METHOD_SEND, METHOD_SEND_BATCH,
    METHOD_SET, METHOD_UPDATE,
};
use crate::app::App;
use crate::error::{MeshError, Result};
use crate::rpc::InvokeReply;

/// The exported form of a session
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(rename = "Userid", default)]
    pub user_id: String,
    #[serde(rename = "Networkid")]
    pub connection_id: String,
    #[serde(rename = "Serverid")]
    pub owner_node_id: String,
    #[serde(rename = "Settings", default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(rename = "Version", default)]
    pub version: u64,
}

impl SessionSnapshot {
    pub fn new(connection_id: impl Into<String>, owner_node_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            owner_node_id: owner_node_id.into(),
            ..Self::default()
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let snapshot: SessionSnapshot = serde_json::from_value(value.clone())
            .map_err(|e| MeshError::InvalidSession(e.to_string()))?;
        if snapshot.connection_id.is_empty() {
            return Err(MeshError::InvalidSession("empty Networkid".to_string()));
        }
        if snapshot.owner_node_id.is_empty() {
            return Err(MeshError::InvalidSession("empty Serverid".to_string()));
        }
        Ok(snapshot)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unbound,
    Bound,
    Closed,
}

#[derive(Clone)]
pub struct Session {
    app: App,
    snapshot: SessionSnapshot,
    closed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("snapshot", &self.snapshot)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Session {
    /// Only the owning gate creates sessions, at connection accept
    pub(crate) fn create(app: App, connection_id: &str, owner_node_id: &str) -> Self {
        Self {
            app,
            snapshot: SessionSnapshot::new(connection_id, owner_node_id),
            closed: false,
        }
    }

    /// Rebuild a handle from an exported mapping, on any node
    pub fn reconstruct(app: App, exported: &Value) -> Result<Self> {
        Ok(Self {
            app,
            snapshot: SessionSnapshot::from_value(exported)?,
            closed: false,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.snapshot.user_id
    }

    pub fn connection_id(&self) -> &str {
        &self.snapshot.connection_id
    }

    pub fn owner_node_id(&self) -> &str {
        &self.snapshot.owner_node_id
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn snapshot(&self) -> &SessionSnapshot {
        &self.snapshot
    }

    pub fn is_guest(&self) -> bool {
        self.snapshot.user_id.is_empty()
    }

    pub fn state(&self) -> SessionState {
        if self.closed {
            SessionState::Closed
        } else if self.is_guest() {
            SessionState::Unbound
        } else {
            SessionState::Bound
        }
    }

    /// One-shot per connection. A second bind fails and leaves the user id as is.
    pub fn bind(&mut self, user_id: &str) -> Result<()> {
        if self.closed {
            return Err(MeshError::SessionClosed(self.snapshot.connection_id.clone()));
        }
        if !self.snapshot.user_id.is_empty() {
            return Err(MeshError::AlreadyBound(self.snapshot.user_id.clone()));
        }
        if user_id.is_empty() {
            return Err(MeshError::InvalidSession("empty user id".to_string()));
        }
        self.snapshot.user_id = user_id.to_string();
        Ok(())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.snapshot.attributes.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.snapshot.attributes.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.snapshot.attributes.remove(key)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.snapshot.attributes
    }

    pub fn export(&self) -> Result<Value> {
        self.snapshot.to_value()
    }

    /// The owner reported the connection gone. There is no way back.
    pub fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Replace the owner's copy with this handle's snapshot. The owner only
    /// accepts it if the version matches its own; on success this handle
    /// adopts the owner's new snapshot.
    pub async fn push(&mut self) -> Result<()> {
        self.ensure_open()?;
        let reply = self
            .call_owner(METHOD_PUSH, vec![self.snapshot.to_value()?])
            .await?;
        let reply = self.check_reply(reply)?;
        self.snapshot = SessionSnapshot::from_value(&reply.result)?;
        Ok(())
    }

    /// Set one attribute locally, then push the whole snapshot
    pub async fn set_push(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        self.ensure_open()?;
        self.set(key, value);
        self.push().await
    }

    /// Set one attribute at the owner without a version check, then adopt the
    /// owner's snapshot. Unpushed local changes are dropped.
    pub async fn set_remote(&mut self, key: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        let args = vec![json!(self.snapshot.connection_id), json!(key), json!(value)];
        let reply = self.call_owner(METHOD_SET, args).await?;
        let reply = self.check_reply(reply)?;
        self.snapshot = SessionSnapshot::from_value(&reply.result)?;
        Ok(())
    }

    /// Remove one attribute at the owner, then adopt the owner's snapshot
    pub async fn remove_remote(&mut self, key: &str) -> Result<()> {
        self.ensure_open()?;
        let args = vec![json!(self.snapshot.connection_id), json!(key)];
        let reply = self.call_owner(METHOD_REMOVE, args).await?;
        let reply = self.check_reply(reply)?;
        self.snapshot = SessionSnapshot::from_value(&reply.result)?;
        Ok(())
    }

    /// Whether `user_id` has a live connection on this session's gate. Other
    /// gates are not asked.
    pub async fn is_connect(&mut self, user_id: &str) -> Result<bool> {
        self.ensure_open()?;
        let reply = self.call_owner(METHOD_IS_CONNECT, vec![json!(user_id)]).await?;
        let reply = self.check_reply(reply)?;
        Ok(reply.result.as_bool().unwrap_or(false))
    }

    /// Send to several connections on this session's gate. Returns how many
    /// clients accepted the message.
    pub async fn send_batch(
        &mut self,
        connection_ids: &[&str],
        topic: &str,
        payload: Value,
    ) -> Result<u64> {
        self.ensure_open()?;
        let args = vec![json!(connection_ids), json!(topic), payload];
        let reply = self.call_owner(METHOD_SEND_BATCH, args).await?;
        let reply = self.check_reply(reply)?;
        Ok(reply.result.as_u64().unwrap_or(0))
    }

    /// Pull the owner's current snapshot, dropping local changes
    pub async fn update(&mut self) -> Result<()> {
        self.ensure_open()?;
        let reply = self
            .call_owner(METHOD_UPDATE, vec![json!(self.snapshot.connection_id)])
            .await?;
        let reply = self.check_reply(reply)?;
        self.snapshot = SessionSnapshot::from_value(&reply.result)?;
        Ok(())
    }

    /// Ask the owner to forward `payload` to the client and wait for it to
    /// accept
    pub async fn send(&mut self, topic: &str, payload: Value) -> Result<()> {
        self.ensure_open()?;
        let args = vec![json!(self.snapshot.connection_id), json!(topic), payload];
        let reply = self.call_owner(METHOD_SEND, args).await?;
        self.check_reply(reply).map(|_| ())
    }

    /// Fire-and-forget send. Returns once dispatched; delivery failures at the
    /// gate are not reported back.
    pub async fn send_nr(&mut self, topic: &str, payload: Value) -> Result<()> {
        self.ensure_open()?;
        let args = vec![json!(self.snapshot.connection_id), json!(topic), payload];
        let owner = self.snapshot.owner_node_id.clone();
        match self.app.invoke_node_nr(&owner, METHOD_SEND, args).await {
            Err(MeshError::Registry(e)) => Err(self.owner_gone(&e)),
            other => other,
        }
    }

    /// Ask the owner to drop the client connection
    pub async fn close(&mut self) -> Result<()> {
        self.ensure_open()?;
        let reply = self
            .call_owner(METHOD_CLOSE, vec![json!(self.snapshot.connection_id)])
            .await?;
        self.check_reply(reply)?;
        self.closed = true;
        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(MeshError::SessionClosed(self.snapshot.connection_id.clone()));
        }
        Ok(())
    }

    async fn call_owner(&mut self, method: &str, args: Vec<Value>) -> Result<InvokeReply> {
        let owner = self.snapshot.owner_node_id.clone();
        match self.app.invoke_node(&owner, method, args, None).await {
            Err(MeshError::Registry(e)) => Err(self.owner_gone(&e)),
            other => other,
        }
    }

    /// An owner missing from the registry cannot hold the connection any more
    fn owner_gone(&mut self, reason: &str) -> MeshError {
        debug!(
            "Owner of session {} unreachable ({}); marking closed",
            self.snapshot.connection_id, reason
        );
        self.closed = true;
        MeshError::SessionClosed(self.snapshot.connection_id.clone())
    }

    fn check_reply(&mut self, reply: InvokeReply) -> Result<InvokeReply> {
        match reply.error.as_str() {
            "" => Ok(reply),
            ERR_NO_SESSION => {
                self.closed = true;
                Err(MeshError::SessionClosed(self.snapshot.connection_id.clone()))
            }
            ERR_STALE_SESSION => Err(MeshError::StaleSession {
                connection_id: self.snapshot.connection_id.clone(),
                version: self.snapshot.version,
            }),
            ERR_USER_BOUND => Err(MeshError::AlreadyBound(self.snapshot.user_id.clone())),
            other => Err(MeshError::Api(format!(
                "gate {} rejected session call: {}",
                self.snapshot.owner_node_id, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::app::tests::local_app;
    use crate::registry::StaticRegistry;
    use crate::rpc::LocalNetwork;

    fn app() -> App {
        local_app("Gate@gate-1", Arc::new(StaticRegistry::new()), LocalNetwork::new())
    }

    #[test]
    fn test_export_shape() {
        let mut snapshot = SessionSnapshot::new("conn-1", "Gate@gate-1");
        snapshot.user_id = "alice".to_string();
        snapshot.attributes.insert("room".to_string(), "lobby".to_string());
        assert_eq!(
            snapshot.to_value().unwrap(),
            json!({
                "Userid": "alice",
                "Networkid": "conn-1",
                "Serverid": "Gate@gate-1",
                "Settings": {"room": "lobby"},
                "Version": 0
            })
        );
    }

    #[test]
    fn test_reconstruct_requires_ids() {
        assert!(matches!(
            SessionSnapshot::from_value(&json!({"Userid": "alice", "Serverid": "Gate@gate-1"})),
            Err(MeshError::InvalidSession(_))
        ));
        assert!(matches!(
            SessionSnapshot::from_value(&json!({"Networkid": "", "Serverid": "Gate@gate-1"})),
            Err(MeshError::InvalidSession(_))
        ));
        let minimal =
            SessionSnapshot::from_value(&json!({"Networkid": "c", "Serverid": "Gate@gate-1"}))
                .unwrap();
        assert!(minimal.user_id.is_empty());
        assert_eq!(minimal.version, 0);
    }

    #[tokio::test]
    async fn test_bind_is_one_shot() {
        let mut session = Session::create(app(), "conn-1", "Gate@gate-1");
        assert_eq!(session.state(), SessionState::Unbound);

        session.bind("alice").unwrap();
        assert_eq!(session.state(), SessionState::Bound);

        assert!(matches!(session.bind("bob"), Err(MeshError::AlreadyBound(u)) if u == "alice"));
        assert_eq!(session.user_id(), "alice");
    }

    #[tokio::test]
    async fn test_attributes_are_local() {
        let mut session = Session::create(app(), "conn-1", "Gate@gate-1");
        session.set("room", "lobby");
        assert_eq!(session.get("room"), Some("lobby"));
        assert_eq!(session.remove("room").as_deref(), Some("lobby"));
        assert!(session.attributes().is_empty());
    }

    #[tokio::test]
    async fn test_closed_session_rejects_everything() {
        let mut session = Session::create(app(), "conn-1", "Gate@gate-1");
        session.mark_closed();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(matches!(session.bind("alice"), Err(MeshError::SessionClosed(_))));
        assert!(matches!(session.push().await, Err(MeshError::SessionClosed(_))));
        assert!(matches!(
            session.send_nr("chat", json!("hi")).await,
            Err(MeshError::SessionClosed(_))
        ));
        assert!(matches!(
            session.set_push("room", "lobby").await,
            Err(MeshError::SessionClosed(_))
        ));
        assert!(matches!(
            session.is_connect("alice").await,
            Err(MeshError::SessionClosed(_))
        ));
        assert!(session.get("room").is_none());
    }
}
