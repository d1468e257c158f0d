//! meshgate application settings
//!
//! Built once at startup (from the CLI) and shared by `Arc`. Nothing mutates
//! settings after construction.
use std::collections::HashMap;
use std::time::Duration;

use url::Url;

use crate::error::{MeshError, Result};
use crate::registry::{split_node_id, Node};

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_HTTP: u16 = 8510;
pub const DEFAULT_PORT_HTTP: &str = "8510";
pub const STANDARD_PORT_RPC: u16 = 8511;
pub const DEFAULT_PORT_RPC: &str = "8511";

pub const DEFAULT_RPC_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_HEARTBEAT_SECONDS: u64 = 10;
pub const DEFAULT_STATUS_POOL_SIZE: usize = 8;

/// A statically configured cluster member: `Login@login-1=127.0.0.1:8511`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerSpec {
    pub node_id: String,
    pub address: String,
}

impl std::str::FromStr for PeerSpec {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (node_id, address) = s
            .split_once('=')
            .ok_or_else(|| format!("Invalid peer (expected service@id=host:port): {}", s))?;
        if split_node_id(node_id).is_none() {
            return Err(format!("Invalid peer node id (expected service@id): {}", node_id));
        }
        if address.is_empty() {
            return Err(format!("Invalid peer address: {}", s));
        }
        Ok(Self {
            node_id: node_id.to_string(),
            address: address.to_string(),
        })
    }
}

impl PeerSpec {
    pub fn to_node(&self) -> Node {
        Node::from_id(&self.node_id, &self.address, HashMap::new())
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    // This node's id, `<service>@<instance>`
    pub node_id: String,

    // Server listen address
    pub listen_address: String,

    // HTTP admin API listen port
    pub listen_port: u16,

    // RPC listen port
    pub listen_port_rpc: u16,

    // Default deadline for request/reply calls
    pub rpc_timeout: Duration,

    // Status store url: `redis://...` or `memory://`; None disables health records
    pub status_store_url: Option<String>,

    // Max pooled connections to the status store
    pub status_pool_size: usize,

    // How often this node refreshes its status record (must stay below the 30s expiry)
    pub heartbeat_interval: Duration,

    // Statically known cluster members
    pub peers: Vec<PeerSpec>,

    // Metadata advertised for this node
    pub metadata: HashMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            node_id: "Gate@gate-1".to_string(),
            listen_address: "127.0.0.1".to_string(),
            listen_port: STANDARD_PORT_HTTP,
            listen_port_rpc: STANDARD_PORT_RPC,
            rpc_timeout: Duration::from_millis(DEFAULT_RPC_TIMEOUT_MS),
            status_store_url: None,
            status_pool_size: DEFAULT_STATUS_POOL_SIZE,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECONDS),
            peers: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

impl Settings {
    /// Fail fast on settings no node could run with
    pub fn validate(&self) -> Result<()> {
        if split_node_id(&self.node_id).is_none() {
            return Err(MeshError::Config(format!(
                "node id must look like service@instance: {}",
                self.node_id
            )));
        }
        if self.rpc_timeout.is_zero() {
            return Err(MeshError::Config("rpc timeout must be non-zero".to_string()));
        }
        if self.heartbeat_interval.is_zero()
            || self.heartbeat_interval >= crate::status::STATUS_EXPIRE_TIME
        {
            return Err(MeshError::Config(format!(
                "heartbeat interval must be between 0 and {}s",
                crate::status::STATUS_EXPIRE_TIME.as_secs()
            )));
        }
        if self.status_pool_size == 0 {
            return Err(MeshError::Config("status pool size must be non-zero".to_string()));
        }
        if let Some(url) = &self.status_store_url {
            let parsed = Url::parse(url)?;
            match parsed.scheme() {
                "redis" | "rediss" | "memory" => {}
                other => {
                    return Err(MeshError::Config(format!(
                        "unsupported status store scheme: {}",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    pub fn service_name(&self) -> &str {
        split_node_id(&self.node_id)
            .map(|(service, _)| service)
            .unwrap_or(&self.node_id)
    }

    pub fn rpc_address(&self) -> String {
        format!("{}:{}", self.listen_address, self.listen_port_rpc)
    }

    /// The node record this process advertises
    pub fn local_node(&self) -> Node {
        Node::from_id(&self.node_id, &self.rpc_address(), self.metadata.clone())
    }
}
