//! Seam between the worker and the pipeline backend.

use std::path::Path;

use async_trait::async_trait;
use meshgen_comfyui::completion::CompletionWaiter;
use meshgen_comfyui::manager::{PipelineClient, PipelineClientError};
use serde_json::Value;

/// Operations the generation worker needs from the pipeline backend.
#[async_trait]
pub trait PipelineBackend: Send + Sync {
    /// Whether completion events can currently be received.
    fn is_connected(&self) -> bool;

    /// Upload a staged input file; returns the backend's asset name.
    async fn upload(&self, path: &Path) -> Result<String, PipelineClientError>;

    /// Queue a workflow under `prompt_id`, registered for completion.
    async fn submit(
        &self,
        workflow: &Value,
        prompt_id: &str,
    ) -> Result<CompletionWaiter, PipelineClientError>;
}

#[async_trait]
impl PipelineBackend for PipelineClient {
    fn is_connected(&self) -> bool {
        PipelineClient::is_connected(self)
    }

    async fn upload(&self, path: &Path) -> Result<String, PipelineClientError> {
        PipelineClient::upload(self, path).await
    }

    async fn submit(
        &self,
        workflow: &Value,
        prompt_id: &str,
    ) -> Result<CompletionWaiter, PipelineClientError> {
        PipelineClient::submit(self, workflow, prompt_id).await
    }
}
