//! Integration tests for the HTTP front.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use tiered_cache::config::Config;
use tiered_cache::server::{build_router, AppState};
use tiered_cache::CacheManager;

fn setup() -> (Arc<AppState>, Router) {
    let cache = CacheManager::new(Arc::new(Config::default())).unwrap();
    let state = Arc::new(AppState::new(cache));
    let app = build_router(state.clone());
    (state, app)
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn empty_request(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_put_get_delete_roundtrip() {
    let (_state, app) = setup();
    let value = json!({ "name": "alice", "roles": ["admin", "dev"] });

    let response = app
        .clone()
        .oneshot(json_request("PUT", "/v1/cache/user:1", json!({ "value": value })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(empty_request("GET", "/v1/cache/user:1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["key"], "user:1");
    assert_eq!(body["value"], value);

    let response = app
        .clone()
        .oneshot(empty_request("DELETE", "/v1/cache/user:1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(empty_request("GET", "/v1/cache/user:1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_put_with_options() {
    let (_state, app) = setup();

    let body = json!({ "value": 42, "ttl": 60000, "tags": ["numbers"], "priority": "high", "layers": ["warm"] });
    let response = app
        .clone()
        .oneshot(json_request("PUT", "/v1/cache/answer", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(empty_request("GET", "/v1/cache/answer/info"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let info = body_json(response).await;
    assert_eq!(info["layer"], "warm");
    assert_eq!(info["metadata"]["priority"], "high");
    assert_eq!(info["metadata"]["tags"], json!(["numbers"]));
    assert!(info["remaining_ttl"].as_u64().unwrap() <= 60000);
}

#[tokio::test]
async fn test_zero_ttl_is_bad_request() {
    let (_state, app) = setup();
    let response = app
        .oneshot(json_request("PUT", "/v1/cache/k", json!({ "value": 1, "ttl": 0 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["error"].as_str().unwrap().contains("TTL"));
}

#[tokio::test]
async fn test_invalidate_and_clear() {
    let (state, app) = setup();
    for (key, tag) in [("a", "x"), ("b", "y"), ("c", "x")] {
        let body = json!({ "value": key, "tags": [tag] });
        let uri = format!("/v1/cache/{key}");
        let response = app.clone().oneshot(json_request("PUT", &uri, body)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let response = app
        .clone()
        .oneshot(json_request("POST", "/v1/cache/invalidate", json!({ "tags": ["x"] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["removed"], 2);
    assert!(state.cache.contains("b").await);

    let response = app
        .oneshot(json_request("POST", "/v1/cache/clear", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(!state.cache.contains("b").await);
}

#[tokio::test]
async fn test_stats_and_metrics() {
    let (state, app) = setup();
    state
        .cache
        .set("k", json!("v"), Default::default())
        .await
        .unwrap();
    state.cache.get("k").await.unwrap();

    let response = app
        .clone()
        .oneshot(empty_request("GET", "/v1/cache/stats"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response).await;
    assert_eq!(stats["layers"][0]["layer"], "hot");
    assert_eq!(stats["layers"][0]["hits"], 1);
    assert_eq!(stats["tracked_keys"], 1);

    let response = app
        .oneshot(empty_request("GET", "/metrics"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("tiered_cache_hits_total{layer=\"hot\"} 1"));
}

#[tokio::test]
async fn test_health_reflects_stop() {
    let (state, app) = setup();

    let response = app
        .clone()
        .oneshot(empty_request("GET", "/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "ok");

    state.cache.stop().await;
    let response = app
        .oneshot(empty_request("GET", "/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_event_stream_until_stop() {
    let (state, app) = setup();

    let response = app
        .oneshot(empty_request("GET", "/v1/cache/events"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    state.cache.set("k", json!(1), Default::default()).await.unwrap();
    state.cache.stop().await;

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("event: written"));
    assert!(text.contains("event: stopped"));
}
