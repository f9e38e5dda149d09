//! Catalog editing endpoints.
//!
//! Writes go through `CatalogStore::update`, so each one recomputes the
//! definition's dependencies, persists the whole catalog and invalidates its
//! cached reads.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::{ApiError, AppState};
use crate::catalog::{CatalogKind, DerivedSensorDefinition};
use crate::formula;
use crate::CatalogError;

// ---

pub fn router() -> Router<AppState> {
    // ---
    Router::new()
        .route("/probes/{kind}", get(list))
        .route("/probes/{kind}/{key}", put(upsert).delete(remove))
        .route("/formula/check", axum::routing::post(check))
}

fn parse_kind(kind: &str) -> Result<CatalogKind, ApiError> {
    kind.parse().map_err(|e: anyhow::Error| ApiError::bad_request(e.to_string()))
}

async fn list(
    Path(kind): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let kind = parse_kind(&kind)?;
    let catalog = state.builder.catalogs().load(kind).await?;

    let mut body = catalog.to_body();
    body["success"] = json!(true);
    Ok(Json(body))
}

async fn upsert(
    Path((kind, key)): Path<(String, String)>,
    State(state): State<AppState>,
    Json(mut definition): Json<DerivedSensorDefinition>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let kind = parse_kind(&kind)?;
    definition.key = key.clone();

    let (replaced, saved) = state
        .builder
        .catalogs()
        .update(kind, |catalog| {
            let replaced = catalog.upsert(definition)?.is_some();
            let saved = catalog
                .get(&key)
                .cloned()
                .ok_or_else(|| CatalogError::NotFound(key.clone()))?;
            Ok((replaced, saved))
        })
        .await?;

    info!(%kind, key = %key, replaced, "definition saved");
    let status = if replaced {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(json!({ "success": true, "definition": saved }))))
}

async fn remove(
    Path((kind, key)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    // ---
    let kind = parse_kind(&kind)?;
    state
        .builder
        .catalogs()
        .update(kind, |catalog| {
            catalog
                .remove(&key)
                .ok_or_else(|| CatalogError::NotFound(key.clone()))
        })
        .await?;

    info!(%kind, key = %key, "definition removed");
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckRequest {
    formula_source: String,
}

/// Editor-side validation: parse the formula and report what it reads.
async fn check(Json(request): Json<CheckRequest>) -> Result<impl IntoResponse, ApiError> {
    // ---
    let deps = formula::resolve(&request.formula_source)?;
    Ok(Json(json!({
        "success": true,
        "dependencyKeys": deps.dependency_keys,
        "fieldMapping": deps.field_mapping,
    })))
}
