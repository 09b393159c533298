//! Route definitions for generation requests.
//!
//! All endpoints require a bearer token.

use axum::routing::{get, post};
use axum::Router;

use crate::handlers::generation;
use crate::state::AppState;

/// Routes mounted at the root.
///
/// ```text
/// POST   /generate                -> submit_generation
/// GET    /status/{request_id}     -> get_status
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/generate", post(generation::submit_generation))
        .route("/status/{request_id}", get(generation::get_status))
}
