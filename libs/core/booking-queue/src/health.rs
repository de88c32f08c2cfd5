//! Health and admin endpoints for booking workers.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`): queue and store reachable
//! - Worker stats (`/stats`)
//! - Prometheus metrics (`/metrics`)
//! - Dead-letter stats (`/admin/dlq/stats`)

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::client::QueueClient;
use crate::dlq::DeadLetterSink;
use crate::metrics;
use crate::store::BookingStore;
use crate::supervisor::{Supervisor, SupervisorStats};

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    pub supervisor: Arc<Supervisor>,
    pub queue: Arc<dyn QueueClient>,
    pub store: Arc<dyn BookingStore>,
    pub dead_letters: Arc<dyn DeadLetterSink>,
    pub app_name: String,
    pub app_version: String,
}

/// Health response for liveness probes.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always "healthy" if responding
    pub status: &'static str,
    pub name: String,
    pub version: String,
}

/// Liveness probe handler.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        name: state.app_name,
        version: state.app_version,
    })
}

/// Readiness probe handler.
///
/// Ready when the worker pool is running and both the queue and the store
/// answer their health checks.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let (queue, store) = tokio::join!(state.queue.health_check(), state.store.health_check());
    let running = state.supervisor.is_running();

    let check = |r: &Result<(), String>| match r {
        Ok(()) => "ok".to_string(),
        Err(e) => format!("error: {e}"),
    };
    let queue = queue.map_err(|e| e.to_string());
    let store = store.map_err(|e| e.to_string());

    let body = json!({
        "status": if running && queue.is_ok() && store.is_ok() { "ready" } else { "not_ready" },
        "checks": {
            "workers": if running { "running" } else { "stopped" },
            "queue": check(&queue),
            "store": check(&store),
        }
    });

    if running && queue.is_ok() && store.is_ok() {
        Ok((StatusCode::OK, Json(body)))
    } else {
        Err((StatusCode::SERVICE_UNAVAILABLE, Json(body)))
    }
}

/// Aggregated and per-worker counters.
pub async fn stats_handler(State(state): State<HealthState>) -> Json<SupervisorStats> {
    Json(state.supervisor.get_stats())
}

/// Prometheus metrics endpoint handler.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

/// `GET /admin/dlq/stats`
pub async fn dlq_stats_handler(
    State(state): State<HealthState>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    match state.dead_letters.stats().await {
        Ok(stats) => Ok(Json(stats)),
        Err(e) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )),
    }
}

/// Create the health router.
pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/admin/dlq/stats", get(dlq_stats_handler))
        .with_state(state)
}
