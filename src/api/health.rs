//! Health check endpoint

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::ApiState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub hub: String,
    /// Short fingerprint of the hub key
    pub fingerprint: String,
    pub nodes: usize,
    pub sessions: usize,
    pub devices: usize,
    pub pending_enrollments: usize,
}

/// Liveness check with registry counts
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    let hub = &state.hub;
    Json(HealthResponse {
        status: if hub.is_shutting_down() { "stopping" } else { "ok" },
        version: env!("CARGO_PKG_VERSION"),
        hub: hub.config().name.clone(),
        fingerprint: hub.identity().short_id().to_string(),
        nodes: hub.nodes().len(),
        sessions: hub.sessions().len(),
        devices: hub.devices().len(),
        pending_enrollments: hub.enrollment().pending_requests().len(),
    })
}

/// Build health routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}
