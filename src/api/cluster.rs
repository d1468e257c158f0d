//! Node and cluster views for operators
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::app::App;
use crate::error::Result;
use crate::registry::Node;
use crate::selector::SelectOptions;
use crate::status::ServerStatusRecord;

/// This node as seen by itself
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeStatusResponse {
    pub node_id: String,
    pub service: String,
    pub address: String,
    pub executing: i64,
    pub pending_calls: usize,
    pub methods: Vec<String>,
    pub status_store_configured: bool,
    pub status: ServerStatusRecord,
}

/// A registered node together with its published status
#[derive(Debug, Serialize, Deserialize)]
pub struct NodeView {
    #[serde(flatten)]
    pub node: Node,
    pub status: ServerStatusRecord,
}

#[instrument(skip(app), level = "debug")]
pub async fn status(State(app): State<App>) -> Json<NodeStatusResponse> {
    let node = app.local_node();
    Json(NodeStatusResponse {
        node_id: node.id.clone(),
        service: node.service_name.clone(),
        address: node.address.clone(),
        executing: app.server().executing(),
        pending_calls: app.rpc().pending().len(),
        methods: app.server().methods(),
        status_store_configured: app.status().is_configured(),
        status: app.status().read(&node.id).await,
    })
}

#[instrument(skip(app), level = "debug")]
pub async fn nodes(
    State(app): State<App>,
    Path(service): Path<String>,
) -> Result<Json<Vec<NodeView>>> {
    let mut views = Vec::new();
    for node in app.registry().get_nodes(&service).await? {
        let status = app.status().read(&node.id).await;
        views.push(NodeView { node, status });
    }
    Ok(Json(views))
}

/// Run the selector once, as an invoke would
#[instrument(skip(app), level = "debug")]
pub async fn select(State(app): State<App>, Path(service): Path<String>) -> Result<Json<Node>> {
    let node = app.selector().select(&service, &SelectOptions::default()).await?;
    Ok(Json(node))
}
