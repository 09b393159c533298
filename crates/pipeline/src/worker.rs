//! Background generation worker.
//!
//! Drives one request through the pipeline:
//!
//! ```text
//! Staging -> Submitting -> AwaitingCompletion -> Locating -> Done
//! ```
//!
//! Every outcome, including a panic, ends up in the request's status
//! record; nothing is propagated to the submitter. The staging directory
//! is removed on success and left in place on failure for inspection.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use futures::FutureExt as _;
use meshgen_comfyui::completion::WaitError;
use meshgen_comfyui::manager::PipelineClientError;
use meshgen_core::artifact::{find_latest, LocateError};
use meshgen_core::error::CoreError;
use meshgen_core::job::{JobRequest, MSG_PROCESSING};
use rand::Rng as _;

use crate::backend::PipelineBackend;
use crate::status_table::StatusTable;
use crate::workflow::WorkflowTemplate;

/// URL prefix under which the output directory is served.
pub const STATIC_URL_PREFIX: &str = "/static";

/// Suffix of the generated model files.
const ARTIFACT_SUFFIX: &str = ".glb";

/// File name of the staged input image.
const STAGED_INPUT_NAME: &str = "input.png";

/// Upper bound (inclusive) of per-job workflow seeds.
const MAX_SEED: u64 = 1_000_000_000;

const MSG_UPLOADING: &str = "Uploading image to the generation pipeline";
const MSG_AWAITING: &str = "Waiting for the 3D model to be generated";
const MSG_LOCATING: &str = "Collecting the generated model";

/// Paths and time limits used by every worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Parent of the per-request staging directories.
    pub staging_root: PathBuf,
    /// Directory the backend writes artifacts into (served under `/static`).
    pub output_dir: PathBuf,
    /// Deadline for the completion event after the prompt is queued.
    pub completion_timeout: Duration,
    /// Pause between the completion event and the artifact scan.
    pub settle_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            staging_root: PathBuf::from("/tmp"),
            output_dir: PathBuf::from("/output"),
            completion_timeout: Duration::from_secs(600),
            settle_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStage {
    Staging,
    Submitting,
    AwaitingCompletion,
    Locating,
}

impl WorkerStage {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStage::Staging => "staging",
            WorkerStage::Submitting => "submitting",
            WorkerStage::AwaitingCompletion => "awaiting_completion",
            WorkerStage::Locating => "locating",
        }
    }
}

impl std::fmt::Display for WorkerStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a request failed. The display text becomes part of the status message.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("Invalid base64 image data: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Failed to stage input at {}: {source}", .path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pipeline(#[from] PipelineClientError),

    #[error("Timed out after {}s waiting for the pipeline to finish", .0.as_secs())]
    CompletionTimeout(Duration),

    #[error("Pipeline execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Pipeline client shut down before the job finished")]
    Abandoned,

    #[error("Failed to generate 3D model: {0}")]
    ArtifactMissing(#[from] LocateError),

    #[error(transparent)]
    Status(#[from] CoreError),

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

impl From<WaitError> for GenerationError {
    fn from(e: WaitError) -> Self {
        match e {
            WaitError::TimedOut(after) => GenerationError::CompletionTimeout(after),
            WaitError::Failed(reason) => GenerationError::ExecutionFailed(reason),
            WaitError::Abandoned => GenerationError::Abandoned,
        }
    }
}

/// Runs generation requests against a shared pipeline backend.
pub struct GenerationWorker {
    backend: Arc<dyn PipelineBackend>,
    table: Arc<StatusTable>,
    workflow: Arc<WorkflowTemplate>,
    settings: WorkerSettings,
}

impl GenerationWorker {
    pub fn new(
        backend: Arc<dyn PipelineBackend>,
        table: Arc<StatusTable>,
        workflow: Arc<WorkflowTemplate>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            backend,
            table,
            workflow,
            settings,
        }
    }

    pub fn table(&self) -> &Arc<StatusTable> {
        &self.table
    }

    /// Staging directory owned by `request_id`.
    pub fn staging_dir(&self, request_id: &str) -> PathBuf {
        self.settings.staging_root.join(request_id)
    }

    /// Process one request to a terminal status record.
    pub async fn run(&self, job: JobRequest) {
        let outcome = AssertUnwindSafe(self.generate(&job))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(GenerationError::Panicked(panic_message(panic.as_ref()))));

        match outcome {
            Ok(model_url) => {
                if let Err(e) = self.table.complete(&job.id, &model_url).await {
                    tracing::error!(request_id = %job.id, error = %e, "Failed to record completion");
                    return;
                }
                tracing::info!(request_id = %job.id, model_url = %model_url, "Generation completed");

                let staging = self.staging_dir(&job.id);
                if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
                    tracing::warn!(
                        request_id = %job.id,
                        path = %staging.display(),
                        error = %e,
                        "Failed to clean up staging directory",
                    );
                }
            }
            Err(e) => {
                tracing::error!(request_id = %job.id, error = %e, "Generation failed");
                if let Err(e) = self
                    .table
                    .fail(&job.id, format!("Failed to generate model: {e}"))
                    .await
                {
                    tracing::error!(request_id = %job.id, error = %e, "Failed to record failure");
                }
            }
        }
    }

    /// Run the pipeline for `job` and return the artifact URL.
    async fn generate(&self, job: &JobRequest) -> Result<String, GenerationError> {
        self.enter(job, WorkerStage::Staging, MSG_PROCESSING).await?;
        let input = self.stage(job).await?;

        self.enter(job, WorkerStage::Submitting, MSG_UPLOADING).await?;
        let asset_name = self.backend.upload(&input).await?;
        let seed = rand::rng().random_range(1..=MAX_SEED);
        let target = self.workflow.output_target_for(&job.id);
        let workflow = self.workflow.prepare(seed, &asset_name, &target);
        let prompt_id = uuid::Uuid::new_v4().to_string();
        let waiter = self.backend.submit(&workflow, &prompt_id).await?;
        tracing::info!(
            request_id = %job.id,
            prompt_id = %prompt_id,
            seed,
            asset = %asset_name,
            filename_prefix = %target.filename_prefix(),
            "Prompt queued",
        );

        self.enter(job, WorkerStage::AwaitingCompletion, MSG_AWAITING).await?;
        waiter.wait(self.settings.completion_timeout).await?;

        self.enter(job, WorkerStage::Locating, MSG_LOCATING).await?;
        tokio::time::sleep(self.settings.settle_delay).await;
        let dir = if target.subfolder.is_empty() {
            self.settings.output_dir.clone()
        } else {
            self.settings.output_dir.join(&target.subfolder)
        };
        let artifact = find_latest(&dir, &target.file_prefix(), ARTIFACT_SUFFIX)?;
        let file_name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        tracing::info!(request_id = %job.id, artifact = %artifact.display(), "Artifact located");
        Ok(artifact_url(&target.subfolder, &file_name))
    }

    async fn enter(
        &self,
        job: &JobRequest,
        stage: WorkerStage,
        message: &str,
    ) -> Result<(), GenerationError> {
        tracing::debug!(request_id = %job.id, stage = %stage, "Entering stage");
        self.table.mark_processing(&job.id, message).await?;
        Ok(())
    }

    /// Decode the image and write it to `<staging_root>/<id>/input.png`.
    async fn stage(&self, job: &JobRequest) -> Result<PathBuf, GenerationError> {
        let bytes = decode_image(&job.image_base64)?;

        let dir = self.staging_dir(&job.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| staging_error(&dir, source))?;
        let path = dir.join(STAGED_INPUT_NAME);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|source| staging_error(&path, source))?;

        tracing::debug!(request_id = %job.id, path = %path.display(), bytes = bytes.len(), "Input staged");
        Ok(path)
    }
}

/// Public URL of an artifact relative to the output directory.
pub fn artifact_url(subfolder: &str, file_name: &str) -> String {
    if subfolder.is_empty() {
        format!("{STATIC_URL_PREFIX}/{file_name}")
    } else {
        format!("{STATIC_URL_PREFIX}/{subfolder}/{file_name}")
    }
}

/// Decode standard-alphabet base64, tolerating a `data:` URL header and
/// embedded whitespace.
fn decode_image(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let payload = match data.split_once(";base64,") {
        Some((header, rest)) if header.starts_with("data:") => rest,
        _ => data,
    };
    let compact: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    base64::engine::general_purpose::STANDARD.decode(compact)
}

fn staging_error(path: &Path, source: std::io::Error) -> GenerationError {
    GenerationError::Staging {
        path: path.to_path_buf(),
        source,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn artifact_url_with_and_without_subfolder() {
        assert_eq!(artifact_url("3D", "mesh_00001_.glb"), "/static/3D/mesh_00001_.glb");
        assert_eq!(artifact_url("", "mesh_00001_.glb"), "/static/mesh_00001_.glb");
    }

    #[test]
    fn decode_plain_and_data_url() {
        assert_eq!(decode_image("aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_image("data:image/png;base64,aGVs\nbG8=").unwrap(), b"hello");
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_image("not base64!!").is_err());
    }

    #[test]
    fn wait_errors_map_to_generation_errors() {
        assert_matches!(
            GenerationError::from(WaitError::TimedOut(Duration::from_secs(600))),
            GenerationError::CompletionTimeout(d) if d.as_secs() == 600
        );
        assert_matches!(
            GenerationError::from(WaitError::Failed("oom".into())),
            GenerationError::ExecutionFailed(msg) if msg == "oom"
        );
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("kaboom")), "kaboom");
        assert_eq!(panic_message(&42u8), "unknown panic");
    }
}
