//! Node endpoints
//!
//! WebSocket endpoint for node sessions and REST endpoints for listing and
//! removing enrolled nodes

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::WebSocket,
    },
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
};
use chrono::{DateTime, Utc};
use futures::SinkExt;
use serde::{Deserialize, Serialize};

use super::auth::require_api_key;
use super::{ApiResult, ApiState, text_channel};
use crate::devices::Device;
use crate::nodes::{Action, ConnectionStatus, Node, NodeId};
use crate::protocol::{self, Frame};
use crate::session;
use crate::state::StateTree;

/// Query parameters for node WebSocket connection
#[derive(Debug, Deserialize)]
struct NodeWsQuery {
    node_id: String,
}

/// REST view of a node
#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub id: NodeId,
    pub name: String,
    pub status: ConnectionStatus,
    pub actions: Vec<Action>,
    pub layouts: Vec<StateTree>,
    pub state: StateTree,
    pub enrolled_at: DateTime<Utc>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<Node> for NodeResponse {
    fn from(node: Node) -> Self {
        Self {
            id: node.id,
            name: node.name,
            status: node.status,
            actions: node.actions,
            layouts: node.layouts,
            state: node.state,
            enrolled_at: node.enrolled_at,
            connected_at: node.connected_at,
            last_seen: node.last_seen,
        }
    }
}

/// Removal summary
#[derive(Debug, Serialize)]
pub struct RemovedNode {
    pub id: NodeId,
    pub devices: Vec<Device>,
}

/// Build node routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_nodes))
        .route("/{node_id}", get(get_node).delete(remove_node))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Build node WebSocket router
pub fn ws_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/node", get(ws_upgrade))
        .with_state(state)
}

/// All known nodes, ordered by id
async fn list_nodes(State(state): State<Arc<ApiState>>) -> Json<Vec<NodeResponse>> {
    Json(
        state
            .hub
            .nodes()
            .all()
            .into_iter()
            .map(NodeResponse::from)
            .collect(),
    )
}

async fn get_node(
    State(state): State<Arc<ApiState>>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<NodeResponse>> {
    let id = NodeId::parse(&node_id)?;
    let node = state
        .hub
        .nodes()
        .get(&id)
        .ok_or_else(|| crate::Error::UnknownNode(node_id))?;
    Ok(Json(NodeResponse::from(node)))
}

async fn remove_node(
    State(state): State<Arc<ApiState>>,
    Path(node_id): Path<String>,
) -> ApiResult<Json<RemovedNode>> {
    let id = NodeId::parse(&node_id)?;
    let devices = state.hub.devices().by_node(&id);
    state.hub.remove_node(&id)?;
    Ok(Json(RemovedNode { id, devices }))
}

/// Handle WebSocket upgrade for node sessions
async fn ws_upgrade(
    State(state): State<Arc<ApiState>>,
    query: Result<Query<NodeWsQuery>, axum::extract::rejection::QueryRejection>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Ok(Query(query)) = query else {
        return (StatusCode::BAD_REQUEST, "node_id query parameter required").into_response();
    };
    ws.on_upgrade(move |socket| handle_node_socket(socket, state, query.node_id))
}

/// Adapt a node WebSocket to the transport-agnostic session task
async fn handle_node_socket(socket: WebSocket, state: Arc<ApiState>, raw_id: String) {
    let (inbound, mut outbound) = text_channel(socket);

    let node_id = match NodeId::parse(&raw_id) {
        Ok(id) => id,
        Err(e) => {
            if let Ok(json) = protocol::encode(&Frame::error("unknown_node", e.to_string())) {
                let _ = outbound.send(json).await;
            }
            let _ = outbound.close().await;
            return;
        }
    };

    session::run(state.hub.clone(), node_id, inbound, outbound).await;
}
