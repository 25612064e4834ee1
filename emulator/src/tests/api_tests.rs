//! Tests for the REST facade: routing, custom methods, status mapping and
//! error body shape

use super::test_utils::*;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use shared::config::EmulatorConfig;
use std::sync::Arc;
use tower::ServiceExt;

use crate::api::{create_router, AppState};

fn test_router(config: EmulatorConfig) -> Router {
    let state = AppState {
        registry: default_registry(),
        signer: shared_signer(),
        config: Arc::new(config),
    };
    create_router(state)
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let request = match body {
        Some(json) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

const QUEUES_URI: &str = "/v2/projects/test-project/locations/us-central1/queues";

fn queue_uri(suffix: &str) -> String {
    format!("{}/primary{}", QUEUES_URI, suffix)
}

fn create_queue_body() -> serde_json::Value {
    serde_json::json!({ "name": QUEUE_NAME })
}

#[tokio::test]
async fn health_endpoint_responds() {
    let router = test_router(EmulatorConfig::default());
    let (status, body) = send(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn queue_lifecycle_over_the_wire() {
    let router = test_router(EmulatorConfig::default());

    // Create.
    let (status, created) = send(&router, "POST", QUEUES_URI, Some(create_queue_body())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["name"], QUEUE_NAME);
    assert_eq!(created["state"], "RUNNING");
    assert_eq!(created["rateLimits"]["maxDispatchesPerSecond"], 500.0);
    assert_eq!(created["retryConfig"]["minBackoff"], "0.1s");

    // Get and list.
    let (status, fetched) = send(&router, "GET", &queue_uri(""), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], QUEUE_NAME);

    let (status, listed) = send(&router, "GET", QUEUES_URI, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["queues"].as_array().unwrap().len(), 1);

    // Pause and resume via custom methods.
    let (status, paused) = send(&router, "POST", &queue_uri(":pause"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(paused["state"], "PAUSED");

    let (status, resumed) = send(&router, "POST", &queue_uri(":resume"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resumed["state"], "RUNNING");

    // Purge keeps the queue.
    let (status, purged) = send(&router, "POST", &queue_uri(":purge"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(purged["name"], QUEUE_NAME);

    // Delete, then the queue is gone.
    let (status, _) = send(&router, "DELETE", &queue_uri(""), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, error) = send(&router, "GET", &queue_uri(""), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["error"]["status"], "NOT_FOUND");
    assert_eq!(error["error"]["code"], 404);
}

#[tokio::test]
async fn update_queue_is_unimplemented() {
    let router = test_router(EmulatorConfig::default());
    send(&router, "POST", QUEUES_URI, Some(create_queue_body())).await;

    let (status, body) = send(
        &router,
        "PATCH",
        &queue_uri(""),
        Some(serde_json::json!({ "name": QUEUE_NAME })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(body["error"]["status"], "UNIMPLEMENTED");
}

#[tokio::test]
async fn duplicate_queue_maps_to_conflict() {
    let router = test_router(EmulatorConfig::default());
    send(&router, "POST", QUEUES_URI, Some(create_queue_body())).await;
    let (status, body) = send(&router, "POST", QUEUES_URI, Some(create_queue_body())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["status"], "ALREADY_EXISTS");
}

#[tokio::test]
async fn malformed_queue_name_maps_to_bad_request() {
    let router = test_router(EmulatorConfig::default());
    let (status, body) = send(
        &router,
        "POST",
        QUEUES_URI,
        Some(serde_json::json!({ "name": "projects/test-project/locations/us-central1/queues/bad name" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["status"], "INVALID_ARGUMENT");
}

#[tokio::test]
async fn unknown_custom_method_is_rejected() {
    let router = test_router(EmulatorConfig::default());
    send(&router, "POST", QUEUES_URI, Some(create_queue_body())).await;
    let (status, _) = send(&router, "POST", &queue_uri(":reset"), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn task_lifecycle_over_the_wire() {
    let router = test_router(EmulatorConfig::default());
    send(&router, "POST", QUEUES_URI, Some(create_queue_body())).await;

    let far_future = (crate::clock::now() + chrono::TimeDelta::hours(1)).to_rfc3339();
    let create_body = serde_json::json!({
        "task": {
            "httpRequest": { "url": "http://127.0.0.1:1/handler", "httpMethod": "GET" },
            "scheduleTime": far_future,
        }
    });

    // Create with a server-assigned name and zero counters.
    let (status, created) = send(
        &router,
        "POST",
        &queue_uri("/tasks"),
        Some(create_body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let name = created["name"].as_str().unwrap();
    assert!(name.starts_with(&format!("{}/tasks/", QUEUE_NAME)));
    assert_eq!(created["dispatchCount"], 0);
    assert_eq!(created["responseCount"], 0);
    assert!(created["createTime"].is_string());
    assert_eq!(created["httpRequest"]["url"], "http://127.0.0.1:1/handler");

    // Get it back with the submitted fields.
    let task_id = name.rsplit('/').next().unwrap();
    let (status, fetched) = send(
        &router,
        "GET",
        &queue_uri(&format!("/tasks/{}", task_id)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], name);
    assert_eq!(fetched["httpRequest"]["httpMethod"], "GET");

    // List contains it.
    let (status, listed) = send(&router, "GET", &queue_uri("/tasks"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed["tasks"].as_array().unwrap().len(), 1);

    // Delete it, then it is gone and its name is burned.
    let (status, _) = send(
        &router,
        "DELETE",
        &queue_uri(&format!("/tasks/{}", task_id)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &router,
        "GET",
        &queue_uri(&format!("/tasks/{}", task_id)),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let reuse_body = serde_json::json!({
        "task": {
            "name": name,
            "httpRequest": { "url": "http://127.0.0.1:1/handler" },
            "scheduleTime": far_future,
        }
    });
    let (status, body) = send(&router, "POST", &queue_uri("/tasks"), Some(reuse_body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["status"], "ALREADY_EXISTS");
}

#[tokio::test]
async fn run_task_returns_the_rescheduled_task() {
    let router = test_router(EmulatorConfig::default());
    send(&router, "POST", QUEUES_URI, Some(create_queue_body())).await;

    let far_future = (crate::clock::now() + chrono::TimeDelta::hours(1)).to_rfc3339();
    let create_body = serde_json::json!({
        "task": {
            "name": format!("{}/tasks/run-me", QUEUE_NAME),
            "httpRequest": { "url": "http://127.0.0.1:1/handler" },
            "scheduleTime": far_future,
        }
    });
    send(&router, "POST", &queue_uri("/tasks"), Some(create_body)).await;

    let (status, ran) = send(&router, "POST", &queue_uri("/tasks/run-me:run"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ran["name"], format!("{}/tasks/run-me", QUEUE_NAME));
    // The schedule moved from one hour out to now.
    let schedule: chrono::DateTime<chrono::Utc> =
        ran["scheduleTime"].as_str().unwrap().parse().unwrap();
    assert!(schedule <= crate::clock::now());
}

#[tokio::test]
async fn jwks_endpoint_serves_the_signing_key() {
    let router = test_router(EmulatorConfig::default());
    let (status, body) = send(&router, "GET", "/jwks", None).await;
    assert_eq!(status, StatusCode::OK);
    let keys = body["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["alg"], "RS256");
}

#[tokio::test]
async fn discovery_endpoint_requires_a_configured_issuer() {
    let without_issuer = test_router(EmulatorConfig::default());
    let (status, _) = send(
        &without_issuer,
        "GET",
        "/.well-known/openid-configuration",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // The production wiring hands the configured issuer to the signer; the
    // discovery body reflects it.
    let config = EmulatorConfig {
        openid_issuer: Some("http://localhost:8123".to_string()),
        ..Default::default()
    };
    let state = AppState {
        registry: default_registry(),
        signer: Arc::new(
            crate::oidc::OidcSigner::new(config.openid_issuer.clone()).unwrap(),
        ),
        config: Arc::new(config),
    };
    let with_issuer = create_router(state);
    let (status, body) = send(
        &with_issuer,
        "GET",
        "/.well-known/openid-configuration",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["jwks_uri"], "http://localhost:8123/jwks");
}
