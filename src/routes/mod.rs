use axum::Router;
use tokio_util::sync::CancellationToken;

use crate::DerivedSeriesBuilder;

mod derived;
mod error;
mod health;
mod probes;

pub use error::ApiError;

// ---

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    // ---
    pub builder: DerivedSeriesBuilder,
    /// Fired on shutdown; aborts builds still waiting on the backend.
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    // ---
    Router::new()
        .merge(derived::router())
        .merge(probes::router())
        .merge(health::router())
        .with_state(state)
}
