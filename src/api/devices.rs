//! Device and command endpoints

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use super::auth::require_api_key;
use super::{ApiResult, ApiState};
use crate::devices::{Device, DeviceKey};
use crate::router::Command;

/// Operator edit of durable device metadata
#[derive(Debug, Default, Deserialize)]
pub struct UpdateDeviceBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tags: Option<BTreeSet<String>>,
}

/// Command request; keys are parsed here so malformed ones map to
/// `unknown_device` like any other unresolvable target
#[derive(Debug, Deserialize)]
pub struct CommandBody {
    pub devices: Vec<String>,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl TryFrom<CommandBody> for Command {
    type Error = crate::Error;

    fn try_from(body: CommandBody) -> crate::Result<Self> {
        let devices = body
            .devices
            .iter()
            .map(|key| DeviceKey::parse(key))
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self {
            devices,
            cmd: body.cmd,
            args: body.args,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct CommandAccepted {
    /// Commands enqueued, one per targeted device
    pub queued: usize,
}

/// Build device routes
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_devices))
        .route(
            "/{key}",
            get(get_device).patch(update_device).delete(remove_device),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Build command routes
pub fn commands_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", post(send_command))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

/// Every device with live state, keyed by `node.id`
async fn list_devices(State(state): State<Arc<ApiState>>) -> Json<BTreeMap<String, Device>> {
    Json(
        state
            .hub
            .devices_with_state()
            .into_iter()
            .map(|(key, device)| (key.to_string(), device))
            .collect(),
    )
}

async fn get_device(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
) -> ApiResult<Json<Device>> {
    let key = DeviceKey::parse(&key)?;
    Ok(Json(state.hub.device_with_state(&key)?))
}

async fn update_device(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
    Json(body): Json<UpdateDeviceBody>,
) -> ApiResult<Json<Device>> {
    let key = DeviceKey::parse(&key)?;
    state.hub.update_device(&key, body.name, body.tags)?;
    Ok(Json(state.hub.device_with_state(&key)?))
}

async fn remove_device(
    State(state): State<Arc<ApiState>>,
    Path(key): Path<String>,
) -> ApiResult<StatusCode> {
    let key = DeviceKey::parse(&key)?;
    state.hub.remove_device(&key)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Route a command; returns once it is queued, not when the node acts
async fn send_command(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CommandBody>,
) -> ApiResult<(StatusCode, Json<CommandAccepted>)> {
    let command = Command::try_from(body)?;
    let queued = state.hub.route(&command)?;
    Ok((StatusCode::ACCEPTED, Json(CommandAccepted { queued })))
}
