#![allow(dead_code)]
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use meshgate::app::App;
use meshgate::gate::ClientSink;
use meshgate::registry::StaticRegistry;
use meshgate::rpc::LocalNetwork;
use meshgate::selector::SelectOptions;
use meshgate::settings::Settings;
use meshgate::status::StatusStore;

/// Several apps sharing one registry and one in-process network
pub struct TestCluster {
    pub registry: Arc<StaticRegistry>,
    pub network: Arc<LocalNetwork>,
    pub status: StatusStore,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::with_status(StatusStore::unconfigured())
    }

    pub fn with_status(status: StatusStore) -> Self {
        Self {
            registry: Arc::new(StaticRegistry::new()),
            network: LocalNetwork::new(),
            status,
        }
    }

    pub fn node(&self, node_id: &str) -> App {
        self.node_with(node_id, Duration::from_secs(5), SelectOptions::default())
    }

    pub fn node_with(&self, node_id: &str, rpc_timeout: Duration, defaults: SelectOptions) -> App {
        let settings = Settings {
            node_id: node_id.to_string(),
            listen_address: format!("mem-{}", node_id),
            rpc_timeout,
            ..Settings::default()
        };
        let app = App::builder(settings)
            .registry(self.registry.clone())
            .status_store(self.status.clone())
            .select_defaults(defaults)
            .local_network(self.network.clone())
            .build()
            .expect("valid test settings");
        self.registry.register(app.local_node().clone());
        app
    }
}

/// Client socket stand-in that records what the gate writes
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<(String, Value)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn messages(&self) -> Vec<(String, Value)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClientSink for RecordingSink {
    async fn send(&self, topic: &str, payload: &Value) -> meshgate::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.clone()));
        Ok(())
    }

    async fn close(&self) {}
}

/// Poll until `check` holds; the in-process network delivers on spawned tasks
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
