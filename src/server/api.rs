//! JSON HTTP API over a cache of `serde_json::Value`s.
//!
//! - GET/PUT/DELETE /v1/cache/{key}
//! - POST /v1/cache/clear
//! - POST /v1/cache/invalidate
//! - GET /v1/cache/stats
//! - GET /v1/cache/events (SSE)
//! - GET /metrics
//! - GET /health

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::cache::{CacheError, CacheManager, EntryInfo, Layer, SetOptions};
use crate::metrics::MetricsSnapshot;
use crate::server::streaming::events_to_sse_stream;

/// Application state shared across handlers.
pub struct AppState {
    pub cache: CacheManager<Value>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(cache: CacheManager<Value>) -> Self {
        Self {
            cache,
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1/cache/{key}",
            get(get_entry).put(put_entry).delete(delete_entry),
        )
        .route("/v1/cache/{key}/info", get(entry_info))
        .route("/v1/cache/clear", post(clear))
        .route("/v1/cache/invalidate", post(invalidate))
        .route("/v1/cache/stats", get(stats))
        .route("/v1/cache/events", get(events))
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct EntryResponse {
    pub key: String,
    pub value: Value,
}

/// Body of `PUT /v1/cache/{key}`.
#[derive(Debug, Deserialize)]
pub struct PutRequest {
    pub value: Value,
    #[serde(flatten)]
    pub options: SetOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ClearRequest {
    /// Layers to clear; all of them when absent.
    pub layers: Option<Vec<Layer>>,
}

#[derive(Debug, Deserialize)]
pub struct InvalidateRequest {
    pub tags: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateResponse {
    pub removed: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub tracked_keys: usize,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// A [`CacheError`] rendered as an HTTP response.
pub struct ApiError(CacheError);

impl From<CacheError> for ApiError {
    fn from(e: CacheError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CacheError::InvalidTtl | CacheError::Config(_) => StatusCode::BAD_REQUEST,
            CacheError::CapacityExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            CacheError::BackendUnavailable { .. } | CacheError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::Serialization(_) | CacheError::NoRuntime | CacheError::Metrics(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn get_entry(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<EntryResponse>, StatusCode> {
    match state.cache.get(&key).await {
        Some(value) => Ok(Json(EntryResponse { key, value })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn put_entry(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<PutRequest>,
) -> Result<StatusCode, ApiError> {
    debug!(key = %key, layers = ?req.options.layers, "Set request");
    state.cache.set(&key, req.value, req.options).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_entry(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.cache.delete(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn entry_info(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<EntryInfo>, StatusCode> {
    state
        .cache
        .entry_info(&key)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn clear(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ClearRequest>,
) -> Result<StatusCode, ApiError> {
    info!(layers = ?req.layers, "Clear request");
    state.cache.clear(req.layers.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn invalidate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InvalidateRequest>,
) -> Result<Json<InvalidateResponse>, ApiError> {
    let removed = state.cache.invalidate_by_tags(req.tags).await?;
    Ok(Json(InvalidateResponse { removed }))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.cache.get_statistics())
}

async fn events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream = events_to_sse_stream(state.cache.subscribe());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.cache.render_prometheus(),
    )
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>, StatusCode> {
    if state.cache.is_stopped() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let snapshot = state.cache.get_statistics();
    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        tracked_keys: snapshot.tracked_keys,
    }))
}
