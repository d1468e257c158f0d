//! The per-process runtime object
//!
//! An [`App`] ties the settings, registry, selector, status store, RPC client
//! and RPC server of one node together. It is cheap to clone; every clone
//! shares the same parts.
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::error::{MeshError, Result};
use crate::registry::{split_node_id, Node, Registry, StaticRegistry};
use crate::rpc::{
    HandlerMode, InvokeReply, LocalNetwork, PendingCalls, RpcClient, RpcHandler, RpcServer,
    TcpTransport, Transport,
};
use crate::selector::{SelectOptions, Selector};
use crate::settings::Settings;
use crate::status::{LoadProbe, StatusReporter, StatusStore};

enum TransportChoice {
    Tcp,
    Local(Arc<LocalNetwork>),
}

pub struct AppBuilder {
    settings: Settings,
    registry: Option<Arc<dyn Registry>>,
    status: Option<StatusStore>,
    select_defaults: SelectOptions,
    transport: TransportChoice,
}

impl AppBuilder {
    /// Defaults to a static registry built from the configured peers
    pub fn registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Defaults to the store named by `status_store_url`
    pub fn status_store(mut self, status: StatusStore) -> Self {
        self.status = Some(status);
        self
    }

    pub fn select_defaults(mut self, defaults: SelectOptions) -> Self {
        self.select_defaults = defaults;
        self
    }

    /// Use an in-process network instead of TCP. The node's server is bound
    /// on the network at its advertised address.
    pub fn local_network(mut self, network: Arc<LocalNetwork>) -> Self {
        self.transport = TransportChoice::Local(network);
        self
    }

    pub fn build(self) -> Result<App> {
        self.settings.validate()?;

        let local_node = self.settings.local_node();
        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let mut nodes: Vec<Node> = self.settings.peers.iter().map(|p| p.to_node()).collect();
                nodes.push(local_node.clone());
                Arc::new(StaticRegistry::with_nodes(nodes)) as Arc<dyn Registry>
            }
        };
        let status = match self.status {
            Some(status) => status,
            None => StatusStore::from_settings(&self.settings)?,
        };

        let server = Arc::new(RpcServer::new(&self.settings.node_id));
        let pending = Arc::new(PendingCalls::new());
        let transport: Arc<dyn Transport> = match self.transport {
            TransportChoice::Tcp => Arc::new(TcpTransport::new(pending.clone())),
            TransportChoice::Local(network) => {
                network.bind(local_node.address.clone(), server.clone());
                Arc::new(network.transport(pending.clone()))
            }
        };
        let client = RpcClient::new(transport, pending, self.settings.rpc_timeout);
        let selector = Selector::new(registry.clone(), self.select_defaults);

        debug!("Built app for {}", local_node);
        Ok(App {
            inner: Arc::new(AppInner {
                settings: Arc::new(self.settings),
                local_node,
                registry,
                selector,
                status,
                client,
                server,
            }),
        })
    }
}

struct AppInner {
    settings: Arc<Settings>,
    local_node: Node,
    registry: Arc<dyn Registry>,
    selector: Selector,
    status: StatusStore,
    client: RpcClient,
    server: Arc<RpcServer>,
}

#[derive(Clone)]
pub struct App {
    inner: Arc<AppInner>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App")
            .field("node", &self.inner.local_node.id)
            .finish()
    }
}

impl App {
    pub fn builder(settings: Settings) -> AppBuilder {
        AppBuilder {
            settings,
            registry: None,
            status: None,
            select_defaults: SelectOptions::default(),
            transport: TransportChoice::Tcp,
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.inner.settings
    }

    pub fn node_id(&self) -> &str {
        &self.inner.local_node.id
    }

    pub fn local_node(&self) -> &Node {
        &self.inner.local_node
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.inner.registry
    }

    pub fn selector(&self) -> &Selector {
        &self.inner.selector
    }

    pub fn status(&self) -> &StatusStore {
        &self.inner.status
    }

    pub fn server(&self) -> &Arc<RpcServer> {
        &self.inner.server
    }

    pub fn rpc(&self) -> &RpcClient {
        &self.inner.client
    }

    /// Expose a method on this node
    pub fn register(&self, method: impl Into<String>, mode: HandlerMode, handler: impl RpcHandler) {
        self.inner.server.register(method, mode, handler);
    }

    /// Heartbeat publishing this node's executing-call count as its load
    pub fn status_reporter(&self) -> StatusReporter {
        let executing = self.inner.server.executing_counter();
        let probe: Arc<dyn LoadProbe> =
            Arc::new(move || executing.load(std::sync::atomic::Ordering::Relaxed));
        StatusReporter::new(
            self.inner.status.clone(),
            self.node_id(),
            self.inner.settings.heartbeat_interval,
            probe,
        )
    }

    /// Resolve an exact node from its `service@instance` id
    pub async fn get_node_by_id(&self, node_id: &str) -> Result<Node> {
        let (service, _) = split_node_id(node_id)
            .ok_or_else(|| crate::registry_error!("Invalid node id: {}", node_id))?;
        self.inner
            .registry
            .get_nodes(service)
            .await?
            .into_iter()
            .find(|node| node.id == node_id)
            .ok_or_else(|| crate::registry_error!("Node not found: {}", node_id))
    }

    /// `service@instance` names one node; a bare service name goes through
    /// the selector
    pub async fn get_route_node(&self, route: &str) -> Result<Node> {
        if split_node_id(route).is_some() {
            self.get_node_by_id(route).await
        } else {
            self.inner.selector.select(route, &SelectOptions::default()).await
        }
    }

    pub async fn invoke(&self, service: &str, method: &str, args: Vec<Value>) -> Result<InvokeReply> {
        self.invoke_with(service, method, args, &SelectOptions::default(), None)
            .await
    }

    /// Invoke with per-call selection overrides and deadline
    pub async fn invoke_with(
        &self,
        service: &str,
        method: &str,
        args: Vec<Value>,
        options: &SelectOptions,
        timeout: Option<Duration>,
    ) -> Result<InvokeReply> {
        let node = self.inner.selector.select(service, options).await?;
        self.inner.client.call(&node, method, args, timeout).await
    }

    pub async fn invoke_nr(&self, service: &str, method: &str, args: Vec<Value>) -> Result<()> {
        let node = self
            .inner
            .selector
            .select(service, &SelectOptions::default())
            .await?;
        self.inner.client.call_nr(&node, method, args).await
    }

    pub async fn invoke_node(
        &self,
        node_id: &str,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<InvokeReply> {
        let node = self.get_node_by_id(node_id).await?;
        self.inner.client.call(&node, method, args, timeout).await
    }

    pub async fn invoke_node_nr(&self, node_id: &str, method: &str, args: Vec<Value>) -> Result<()> {
        let node = self.get_node_by_id(node_id).await?;
        self.inner.client.call_nr(&node, method, args).await
    }
}

/// Business error text from a reply, as an `Err`, for callers that treat
/// every rejection as a failure
pub fn require_ok(method: &str, reply: InvokeReply) -> Result<Value> {
    if reply.is_err() {
        return Err(MeshError::Api(format!("{} rejected: {}", method, reply.error)));
    }
    Ok(reply.result)
}
