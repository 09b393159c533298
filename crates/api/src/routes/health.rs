use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the push channel to the pipeline backend is up.
    pub pipeline_connected: bool,
}

/// GET /health -- returns service and pipeline health. No auth.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let pipeline_connected = state.backend.is_connected();

    let status = if pipeline_connected { "ok" } else { "degraded" };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        pipeline_connected,
    })
}

pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
