use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tracing::info;

use super::{ApiError, AppState};
use crate::models::TimeWindow;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new().route("/derived/{key}", get(handler))
}

/// `GET /derived/{key}?startDate&endDate[&stepCount]`
async fn handler(
    Path(key): Path<String>,
    Query(window): Query<TimeWindow>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    info!("GET /derived/{} [{} .. {}]", key, window.start, window.end);

    if window.end < window.start {
        return Err(ApiError::bad_request("endDate is before startDate"));
    }

    let series = state
        .builder
        .build_cancellable(&key, &window, &state.shutdown)
        .await?;

    Ok(Json(series.to_response()))
}
