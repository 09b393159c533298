//! Generation job domain: requests, status records and their lifecycle.
//!
//! A [`JobStatus`] moves forward only:
//!
//! ```text
//! Queued -> Processing -> Completed
//!    \           \
//!     `-----------`----> Error
//! ```
//!
//! `Completed` and `Error` are terminal. The artifact URL is present iff
//! the state is `Completed`; [`JobStatus::transition`] is the only way to
//! change state and enforces both rules.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{RequestId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum length of a client-supplied request id.
pub const MAX_REQUEST_ID_LEN: usize = 128;

pub const MSG_QUEUED: &str = "Your request has been queued";
pub const MSG_ACCEPTED: &str = "Your request has been queued for processing";
pub const MSG_PROCESSING: &str = "Your request is being processed";
pub const MSG_COMPLETED: &str = "Your 3D model is ready";

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// A submitted generation request. Immutable once accepted.
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub id: RequestId,
    /// Base64-encoded input image, decoded by the worker (not at submission).
    pub image_base64: String,
}

/// Validate a client-supplied request id.
///
/// The id doubles as the name of the job's staging directory, so besides
/// being non-empty it must be a single safe path segment: ASCII
/// alphanumerics, `-`, `_` and `.`, at most [`MAX_REQUEST_ID_LEN`]
/// characters, and not `.` or `..`.
pub fn validate_request_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation("Request ID is required".into()));
    }
    if id.len() > MAX_REQUEST_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Request ID must not exceed {MAX_REQUEST_ID_LEN} characters"
        )));
    }
    if id == "." || id == ".." {
        return Err(CoreError::Validation(format!("Request ID '{id}' is reserved")));
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(CoreError::Validation(format!(
            "Request ID contains invalid character '{bad}'"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Error,
}

impl JobState {
    /// Wire name, matching the serde representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Error)
    }

    /// Whether moving from `self` to `next` respects forward-only ordering.
    ///
    /// `Processing -> Processing` is allowed so the worker can refresh the
    /// progress message.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Processing)
                | (Queued, Error)
                | (Processing, Processing)
                | (Processing, Completed)
                | (Processing, Error)
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    #[error("Cannot move request {request_id} from {from} to {to}")]
    Backward {
        request_id: RequestId,
        from: JobState,
        to: JobState,
    },

    #[error("Completed status for request {0} requires an artifact URL")]
    MissingArtifact(RequestId),
}

impl From<TransitionError> for CoreError {
    fn from(e: TransitionError) -> Self {
        CoreError::Conflict(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Status record
// ---------------------------------------------------------------------------

/// Current status of one request, as tracked by the status table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub request_id: RequestId,
    pub state: JobState,
    pub message: String,
    pub artifact_url: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl JobStatus {
    /// Fresh record for a just-accepted request.
    pub fn queued(request_id: impl Into<RequestId>) -> Self {
        let now = chrono::Utc::now();
        Self {
            request_id: request_id.into(),
            state: JobState::Queued,
            message: MSG_QUEUED.to_string(),
            artifact_url: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a state change in place.
    ///
    /// `artifact_url` must be `Some` exactly when `next` is `Completed`;
    /// for any other target it is ignored and the stored URL is cleared.
    /// On error the record is left untouched.
    pub fn transition(
        &mut self,
        next: JobState,
        message: impl Into<String>,
        artifact_url: Option<String>,
    ) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError::Backward {
                request_id: self.request_id.clone(),
                from: self.state,
                to: next,
            });
        }
        let artifact_url = match next {
            JobState::Completed => Some(
                artifact_url
                    .ok_or_else(|| TransitionError::MissingArtifact(self.request_id.clone()))?,
            ),
            _ => None,
        };

        self.state = next;
        self.message = message.into();
        self.artifact_url = artifact_url;
        self.updated_at = chrono::Utc::now();
        Ok(())
    }
}
