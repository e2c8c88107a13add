//! Enrollment endpoints
//!
//! Operators list, accept and reject pending requests over REST. Nodes
//! without a credential use the `/ws/enroll` bootstrap socket, driven by
//! [`bootstrap::run`].

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade, ws::WebSocket},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::auth::require_api_key;
use super::{ApiResult, ApiState, text_channel};
use crate::enrollment::PendingRequest;
use crate::nodes::NodeId;
use crate::session::bootstrap;

#[derive(Debug, Deserialize, Default)]
pub struct RejectBody {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AcceptResponse {
    pub request_id: String,
    pub node_id: NodeId,
}

/// Pending requests in arrival order
async fn list_pending(State(state): State<Arc<ApiState>>) -> Json<Vec<PendingRequest>> {
    Json(state.hub.pending_enrollments())
}

async fn accept(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AcceptResponse>> {
    let credential = state.hub.accept_enrollment(&id)?;
    Ok(Json(AcceptResponse {
        request_id: id,
        node_id: credential.node_id,
    }))
}

async fn reject(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    body: Option<Json<RejectBody>>,
) -> ApiResult<axum::http::StatusCode> {
    let reason = body
        .and_then(|Json(b)| b.reason)
        .unwrap_or_else(|| "rejected by operator".to_string());
    state.hub.reject_enrollment(&id, &reason)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

/// Build operator enrollment routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_pending))
        .route("/{id}/accept", post(accept))
        .route("/{id}/reject", post(reject))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Build the bootstrap WebSocket router
pub fn ws_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/enroll", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(State(state): State<Arc<ApiState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_enroll_socket(socket, state))
}

async fn handle_enroll_socket(socket: WebSocket, state: Arc<ApiState>) {
    let (inbound, outbound) = text_channel(socket);
    let end = bootstrap::run(state.hub.clone(), inbound, outbound).await;
    tracing::debug!(end = ?end, "bootstrap socket closed");
}
