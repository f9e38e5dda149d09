// src/routes/health.rs
//! Liveness endpoint for container orchestrators and CI.
//!
//! Sibling of the other route files under the EMBP gateway: the handler and
//! its response type stay private, `router()` is the only export. It never
//! touches the backend, only the in-process cache.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;

/// JSON response body for the `/health` endpoint.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    cache_entries: usize,
}

/// Handle `GET /health`.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        cache_entries: state.builder.cache().len(),
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
