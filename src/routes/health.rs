// src/routes/health.rs
//! Liveness and readiness endpoints.
//!
//! `/health` is static and never touches a dependency, so orchestrators can
//! check it cheaply. `/health/ready` reports whether the database answers and
//! whether the registry, aggregate cache and NMS sync are set up.

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use super::AppState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ReadinessResponse {
    status: &'static str,
    database: bool,
    registry_configured: bool,
    cache_enabled: bool,
    nms_sync_enabled: bool,
}

/// Handle `GET /health`.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

/// Handle `GET /health/ready`. Answers 503 while the database is unreachable.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    // ---
    let database = state
        .store
        .ping()
        .await
        .map_err(|e| tracing::warn!("Readiness check: database unreachable: {}", e))
        .is_ok();

    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            status: if database { "ok" } else { "degraded" },
            database,
            registry_configured: state.registry.is_configured(),
            cache_enabled: state.cache.is_enabled(),
            nms_sync_enabled: state.reconcile.is_enabled(),
        }),
    )
}

/// Subrouter with `/health` and `/health/ready`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}
