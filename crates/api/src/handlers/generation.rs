//! Handlers for submitting generation requests and polling their status.
//!
//! Both endpoints require a bearer token from the configured allow-set
//! via [`BearerAuth`]. Submission only records the request and hands it to
//! the worker pool; polling only reads the status table.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use meshgen_core::error::CoreError;
use meshgen_core::job::{validate_request_id, JobRequest, JobState, JobStatus, MSG_ACCEPTED};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::middleware::auth::BearerAuth;
use crate::state::AppState;

/// Body of `POST /generate`.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    /// Client-chosen request id; also names the staging directory.
    #[serde(default)]
    pub id: Option<String>,
    /// Base64-encoded input image.
    pub image: String,
}

/// Acknowledgement and status payload shared by both endpoints.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResponse {
    pub status: JobState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_url: Option<String>,
    pub request_id: String,
}

impl From<JobStatus> for GenerationResponse {
    fn from(status: JobStatus) -> Self {
        Self {
            status: status.state,
            message: status.message,
            model_url: status.artifact_url,
            request_id: status.request_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// Oversized bodies keep their 413; every other rejection is a 400.
fn rejection_error(rejection: JsonRejection) -> AppError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(rejection.body_text())
    } else {
        AppError::BadRequest(rejection.body_text())
    }
}

/// POST /generate
///
/// Accept a generation request. Returns 202 as soon as the request is
/// queued; the worker runs detached from this call.
pub async fn submit_generation(
    _auth: BearerAuth,
    State(state): State<AppState>,
    payload: Result<Json<GenerateRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<GenerationResponse>)> {
    let Json(input) = payload.map_err(rejection_error)?;

    let request_id = input.id.unwrap_or_default();
    validate_request_id(&request_id)?;

    let status = state
        .worker_pool
        .submit(JobRequest {
            id: request_id.clone(),
            image_base64: input.image,
        })
        .await
        .map_err(CoreError::from)?;

    tracing::info!(request_id = %request_id, "Generation request accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(GenerationResponse {
            status: status.state,
            message: MSG_ACCEPTED.to_string(),
            model_url: None,
            request_id,
        }),
    ))
}

// ---------------------------------------------------------------------------
// Poll
// ---------------------------------------------------------------------------

/// GET /status/{request_id}
///
/// Return the current status record. Never blocks on the worker.
pub async fn get_status(
    _auth: BearerAuth,
    State(state): State<AppState>,
    Path(request_id): Path<String>,
) -> AppResult<Json<GenerationResponse>> {
    let status = state
        .status_table
        .get(&request_id)
        .await
        .ok_or(AppError::Core(CoreError::NotFound {
            entity: "Request",
            id: request_id,
        }))?;

    Ok(Json(status.into()))
}
