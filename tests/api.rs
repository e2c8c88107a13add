//! API endpoint integration tests

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Method, Request, StatusCode},
};
use hearth_hub::api::{self, ApiState};
use hearth_hub::protocol::Frame;
use hearth_hub::{EnrollmentHandle, EnrollmentOutcome, Hub, KeyIdentity};
use serde_json::{Value, json};
use tokio_test::{assert_err, assert_ok};
use tower::ServiceExt;

mod common;
use common::{TestNode, device, enroll, test_config};

const API_KEY: &str = "test-api-key";

/// Build a test API router, optionally guarded by `API_KEY`
fn build_test_router(dir: &std::path::Path, guarded: bool) -> (Arc<Hub>, Router) {
    let mut config = test_config(dir);
    if guarded {
        config.server.api_key = Some(API_KEY.to_string());
    }
    let hub = assert_ok!(Hub::open(config));
    let app = api::router(ApiState::new(hub.clone()));
    (hub, app)
}

/// Send a request and decode the JSON body (null when empty)
async fn call(
    app: &Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
    key: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {key}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Apply a hello for `node` directly, without a live session
fn declare(hub: &Hub, node: &TestNode) {
    let Frame::Hello(hello) = node.hello("", vec![device("1", "switch")], json!({"1": {"on": true}}))
    else {
        unreachable!("hello builds a hello frame");
    };
    hub.declare(&node.id(), hello);
}

#[tokio::test]
async fn test_health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, app) = build_test_router(dir.path(), true);
    enroll(&hub, "porch-light");

    // Health stays open even with an API key set
    let (status, json) = call(&app, Method::GET, "/health", None, None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert_eq!(json["nodes"], 1);
    assert_eq!(json["sessions"], 0);
    assert_eq!(json["fingerprint"], hub.identity().short_id());
}

#[tokio::test]
async fn test_operator_routes_require_auth() {
    let dir = tempfile::tempdir().unwrap();
    let (_hub, app) = build_test_router(dir.path(), true);

    let (status, _) = call(&app, Method::GET, "/api/nodes", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&app, Method::GET, "/api/devices", None, Some("wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, json) = call(&app, Method::GET, "/api/nodes", None, Some(API_KEY)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn test_enrollment_accept() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, app) = build_test_router(dir.path(), false);

    let key = KeyIdentity::generate("porch");
    let (handle, mut outcome) =
        EnrollmentHandle::new(key.public_key.clone(), Some("Porch Light".to_string()));
    let request_id = assert_ok!(hub.request_enrollment(handle));

    let (status, json) = call(&app, Method::GET, "/api/enrollment", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json.as_array().unwrap().len(), 1);
    assert_eq!(json[0]["id"], request_id.as_str());
    assert_eq!(json[0]["label"], "Porch Light");

    let uri = format!("/api/enrollment/{request_id}/accept");
    let (status, json) = call(&app, Method::POST, &uri, None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["node_id"], "porch-light");

    match assert_ok!(outcome.try_recv()) {
        EnrollmentOutcome::Accepted(credential) => {
            assert_eq!(credential.node_id.as_str(), "porch-light");
            assert_ok!(credential.verify(hub.hub_key()));
        }
        EnrollmentOutcome::Rejected(reason) => panic!("unexpected rejection: {reason}"),
    }

    // Resolved requests cannot be resolved again
    let (status, json) = call(&app, Method::POST, &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "unknown_request");

    let (_, json) = call(&app, Method::GET, "/api/enrollment", None, None).await;
    assert_eq!(json, json!([]));
}

#[tokio::test]
async fn test_enrollment_reject() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, app) = build_test_router(dir.path(), false);

    let key = KeyIdentity::generate("stranger");
    let (handle, mut outcome) = EnrollmentHandle::new(key.public_key.clone(), None);
    let request_id = assert_ok!(hub.request_enrollment(handle));

    let uri = format!("/api/enrollment/{request_id}/reject");
    let body = json!({"reason": "not one of ours"});
    let (status, _) = call(&app, Method::POST, &uri, Some(body), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    assert!(matches!(
        assert_ok!(outcome.try_recv()),
        EnrollmentOutcome::Rejected(reason) if reason == "not one of ours"
    ));
    assert!(hub.nodes().is_empty());

    let (status, _) = call(&app, Method::POST, &uri, None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_duplicate_enrollment_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, _app) = build_test_router(dir.path(), false);

    let key = KeyIdentity::generate("twin");
    assert_ok!(hub.request_enrollment(EnrollmentHandle::detached(key.public_key.clone(), None)));
    let duplicate = hub.request_enrollment(EnrollmentHandle::detached(key.public_key.clone(), None));

    let error = assert_err!(duplicate);
    let (status, code) = api::ApiError(error).status();
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(code, "duplicate_request");
}

#[tokio::test]
async fn test_device_listing_and_edits() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, app) = build_test_router(dir.path(), false);
    let node = enroll(&hub, "porch-light");
    declare(&hub, &node);

    let (status, json) = call(&app, Method::GET, "/api/devices", None, None).await;
    assert_eq!(status, StatusCode::OK);
    let lamp = &json["porch-light.1"];
    assert_eq!(lamp["type"], "switch");
    assert_eq!(lamp["online"], true);
    assert_eq!(lamp["state"]["on"], true);

    let body = json!({"name": "Porch", "tags": ["outdoor"]});
    let (status, json) = call(
        &app,
        Method::PATCH,
        "/api/devices/porch-light.1",
        Some(body),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["name"], "Porch");
    assert_eq!(json["tags"], json!(["outdoor"]));
    assert!(hub.is_dirty());

    let (status, _) = call(&app, Method::DELETE, "/api/devices/porch-light.1", None, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, json) = call(&app, Method::GET, "/api/devices/porch-light.1", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "unknown_device");
}

#[tokio::test]
async fn test_command_routing_errors() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, app) = build_test_router(dir.path(), false);
    let node = enroll(&hub, "porch-light");
    declare(&hub, &node);

    // Declared but without a live session
    let body = json!({"devices": ["porch-light.1"], "cmd": "on"});
    let (status, json) = call(&app, Method::POST, "/api/commands", Some(body), None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["error"]["code"], "node_unavailable");

    let body = json!({"devices": ["porch-light.9"], "cmd": "on"});
    let (status, json) = call(&app, Method::POST, "/api/commands", Some(body), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "unknown_device");

    let body = json!({"devices": ["nodot"], "cmd": "on"});
    let (status, json) = call(&app, Method::POST, "/api/commands", Some(body), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "unknown_device");

    let body = json!({"devices": [], "cmd": "on"});
    let (status, json) = call(&app, Method::POST, "/api/commands", Some(body), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["queued"], 0);
}

#[tokio::test]
async fn test_node_lookup_and_removal() {
    let dir = tempfile::tempdir().unwrap();
    let (hub, app) = build_test_router(dir.path(), false);
    let node = enroll(&hub, "porch-light");
    declare(&hub, &node);

    let (status, json) = call(&app, Method::GET, "/api/nodes/porch-light", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["id"], "porch-light");
    assert_eq!(json["status"], "connected");

    let (status, json) = call(&app, Method::DELETE, "/api/nodes/porch-light", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["devices"].as_array().unwrap().len(), 1);

    let (status, json) = call(&app, Method::GET, "/api/nodes/porch-light", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error"]["code"], "unknown_node");
    assert!(hub.devices().is_empty());

    let (status, _) = call(&app, Method::DELETE, "/api/nodes/porch-light", None, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
