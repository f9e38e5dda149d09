//! JSON error responses.
//!
//! Every failure is `{success: false, error, kind}` so a client can tell
//! "no data in range" from "fetch failed" from "formula error".

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::{BuildError, CatalogError, FormulaError};

// ---

#[derive(Debug)]
pub struct ApiError {
    // ---
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    // ---
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "bad_request",
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    fn new(status: StatusCode, kind: &'static str, message: impl ToString) -> Self {
        Self {
            status,
            kind,
            message: message.to_string(),
        }
    }
}

impl From<BuildError> for ApiError {
    fn from(e: BuildError) -> Self {
        // ---
        let (status, kind) = match &e {
            BuildError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            BuildError::MissingDependencyData(_) => (StatusCode::NOT_FOUND, "no_data"),
            BuildError::Fetch { .. } => (StatusCode::BAD_GATEWAY, "fetch_failed"),
            BuildError::Formula(_) => (StatusCode::UNPROCESSABLE_ENTITY, "formula_error"),
            BuildError::Cancelled => (StatusCode::SERVICE_UNAVAILABLE, "cancelled"),
        };
        Self::new(status, kind, e)
    }
}

impl From<CatalogError> for ApiError {
    fn from(e: CatalogError) -> Self {
        // ---
        let (status, kind) = match &e {
            CatalogError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            CatalogError::Fetch(_) => (StatusCode::BAD_GATEWAY, "fetch_failed"),
            CatalogError::Formula(_) => (StatusCode::UNPROCESSABLE_ENTITY, "formula_error"),
        };
        Self::new(status, kind, e)
    }
}

impl From<FormulaError> for ApiError {
    fn from(e: FormulaError) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "formula_error", e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        if self.status.is_server_error() {
            tracing::error!(kind = self.kind, "{}", self.message);
        } else {
            tracing::warn!(kind = self.kind, "{}", self.message);
        }
        let body = json!({
            "success": false,
            "error": self.message,
            "kind": self.kind,
        });
        (self.status, Json(body)).into_response()
    }
}
