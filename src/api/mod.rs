//! HTTP API server for the hub
//!
//! A thin adapter over [`Hub`]: operator REST routes under `/api`, the node
//! session and enrollment bootstrap WebSockets under `/ws`.

mod auth;
pub mod devices;
pub mod enrollment;
pub mod health;
pub mod nodes;

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::ws::{Message, WebSocket},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, Stream, StreamExt, future, stream};
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::hub::Hub;
use crate::{Error, Result};

/// Shared state for API handlers
#[derive(Debug, Clone)]
pub struct ApiState {
    pub hub: Arc<Hub>,
    /// Bearer token required on operator routes, if set
    pub api_key: Option<String>,
}

impl ApiState {
    #[must_use]
    pub fn new(hub: Arc<Hub>) -> Arc<Self> {
        let api_key = hub.config().server.api_key.clone();
        Arc::new(Self { hub, api_key })
    }
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Hub error rendered as an HTTP response
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    /// Status code and stable error code for the wrapped error
    #[must_use]
    pub fn status(&self) -> (StatusCode, &'static str) {
        let status = match &self.0 {
            Error::UnknownRequest(_) | Error::UnknownDevice(_) | Error::UnknownNode(_) => StatusCode::NOT_FOUND,
            Error::DuplicateRequest(_) => StatusCode::CONFLICT,
            Error::NodeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ProtocolViolation(_) => StatusCode::BAD_REQUEST,
            Error::Auth(_) => StatusCode::UNAUTHORIZED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.0.code())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: self.0.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Result type for handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Split a WebSocket into a stream of inbound text frames and a sink of
/// outbound ones
///
/// The stream ends at the first close frame or read error; binary and
/// control frames are skipped.
fn text_channel(
    socket: WebSocket,
) -> (
    impl Stream<Item = String> + Send + Unpin,
    impl Sink<String, Error = axum::Error> + Send + Unpin,
) {
    let (sender, receiver) = socket.split();
    let inbound = Box::pin(stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some((text.to_string(), receiver)),
                Some(Ok(Message::Close(_)) | Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    }));
    let outbound = sender.with(|text: String| future::ok::<_, axum::Error>(Message::Text(text.into())));
    (inbound, outbound)
}

/// Build the full router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .nest("/api/enrollment", enrollment::router(state.clone()))
        .nest("/api/nodes", nodes::router(state.clone()))
        .nest("/api/devices", devices::router(state.clone()))
        .nest("/api/commands", devices::commands_router(state.clone()))
        .nest(
            "/ws",
            nodes::ws_router(state.clone()).merge(enrollment::ws_router(state.clone())),
        )
        .merge(health::router(state))
        .layer(TraceLayer::new_for_http())
}

/// API server
#[derive(Debug)]
pub struct ApiServer {
    state: Arc<ApiState>,
}

impl ApiServer {
    #[must_use]
    pub fn new(hub: Arc<Hub>) -> Self {
        Self {
            state: ApiState::new(hub),
        }
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let addr = self.state.hub.config().bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind API server on {addr}: {e}")))?;

        if self.state.api_key.is_none() {
            tracing::warn!("no API key configured, operator routes are unauthenticated");
        }
        tracing::info!(addr = %addr, "API server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
