//! Heartbeat task that keeps this node's status record alive
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::StatusStore;

/// Source of the load figure published with each heartbeat
pub trait LoadProbe: Send + Sync {
    fn load(&self) -> i64;
}

impl<F> LoadProbe for F
where
    F: Fn() -> i64 + Send + Sync,
{
    fn load(&self) -> i64 {
        self()
    }
}

pub struct StatusReporter {
    store: StatusStore,
    node_id: String,
    interval: Duration,
    probe: Arc<dyn LoadProbe>,
}

impl StatusReporter {
    pub fn new(
        store: StatusStore,
        node_id: impl Into<String>,
        interval: Duration,
        probe: Arc<dyn LoadProbe>,
    ) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            interval,
            probe,
        }
    }

    pub async fn report_once(&self) {
        let load = self.probe.load();
        debug!("Heartbeat {} load={}", self.node_id, load);
        self.store.save(&self.node_id, true, load).await;
    }

    /// Publish immediately, then every interval until `shutdown` flips to true.
    /// A final `running=false` record is written on the way out.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            if !self.store.is_configured() {
                info!("No status store configured; heartbeat disabled");
                return;
            }

            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.report_once().await,
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Heartbeat stopping; marking {} offline", self.node_id);
            self.store.save(&self.node_id, false, self.probe.load()).await;
        })
    }
}
