//! CLI for this application
//!
use std::collections::HashMap;
use std::time::Duration;

use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
pub struct Cli {
    // Node id: service@instance
    #[clap(
        long,
        default_value = "Gate@gate-1",
        env("MESHGATE_NODE_ID"),
        help = "Node id in the form service@instance"
    )]
    pub node_id: String,

    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("MESHGATE_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: String,

    // HTTP API listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("MESHGATE_HTTP_LISTEN_PORT"),
        help = "Port to bind the admin HTTP API to"
    )]
    pub listen_port: u16,

    // RPC listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_RPC,
        env("MESHGATE_RPC_LISTEN_PORT"),
        help = "Port to bind the RPC server to"
    )]
    pub listen_port_rpc: u16,

    // Default RPC deadline
    #[clap(
        long,
        default_value = "5000",
        env("MESHGATE_RPC_TIMEOUT_MS"),
        help = "Default deadline for request/reply calls in milliseconds"
    )]
    pub rpc_timeout_ms: u64,

    // Status store
    #[clap(
        long,
        env("MESHGATE_STATUS_STORE_URL"),
        help = "Status store url (redis://host:port/db or memory://). Unset disables health records"
    )]
    pub status_store_url: Option<String>,

    #[clap(
        long,
        default_value = "8",
        env("MESHGATE_STATUS_POOL_SIZE"),
        help = "Max pooled status store connections"
    )]
    pub status_pool_size: usize,

    #[clap(
        long,
        default_value = "10",
        env("MESHGATE_HEARTBEAT_SECONDS"),
        help = "Seconds between status record refreshes"
    )]
    pub heartbeat_seconds: u64,

    // Cluster configuration information: topology
    #[clap(
        long = "peer",
        env("MESHGATE_PEERS"),
        value_delimiter = ',',
        help = "Known cluster members (e.g., Login@login-1=10.0.0.2:8511,Chat@chat-1=10.0.0.3:8511)"
    )]
    pub peers: Vec<settings::PeerSpec>,

    #[clap(
        long = "metadata",
        env("MESHGATE_METADATA"),
        value_delimiter = ',',
        help = "Node metadata as key=value pairs"
    )]
    pub metadata: Vec<String>,
}

impl Cli {
    pub fn into_settings(self) -> settings::Settings {
        let metadata: HashMap<String, String> = self
            .metadata
            .iter()
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        settings::Settings {
            node_id: self.node_id,
            listen_address: self.listen_address,
            listen_port: self.listen_port,
            listen_port_rpc: self.listen_port_rpc,
            rpc_timeout: Duration::from_millis(self.rpc_timeout_ms),
            status_store_url: self.status_store_url.filter(|url| !url.is_empty()),
            status_pool_size: self.status_pool_size,
            heartbeat_interval: Duration::from_secs(self.heartbeat_seconds),
            peers: self.peers,
            metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn test_cli_into_settings() {
        let cli = Cli::parse_from([
            "meshgate",
            "--node-id",
            "Login@login-1",
            "--rpc-timeout-ms",
            "250",
            "--peer",
            "Gate@gate-1=127.0.0.1:8511,Chat@chat-1=127.0.0.1:8521",
            "--metadata",
            "zone=a,bad-pair",
        ]);
        let settings = cli.into_settings();

        assert_eq!(settings.service_name(), "Login");
        assert_eq!(settings.rpc_timeout, Duration::from_millis(250));
        assert_eq!(settings.peers.len(), 2);
        assert_eq!(settings.metadata.get("zone").map(String::as_str), Some("a"));
        assert_eq!(settings.metadata.len(), 1);
        assert!(settings.status_store_url.is_none());
    }
}
