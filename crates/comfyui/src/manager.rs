//! Shared ComfyUI pipeline client.
//!
//! [`PipelineClient`] owns the single persistent WebSocket push
//! connection to a ComfyUI server, the REST API wrapper, and the
//! [`CompletionRegistry`] that routes completion events to the jobs
//! waiting on them. It is created once at application startup via
//! [`PipelineClient::start`] and shared behind an `Arc` by every worker.
//!
//! The channel itself is kept up by a [`ChannelSupervisor`] task; see
//! [`crate::channel`] for reconnection and history reconciliation.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError};
use crate::client::ComfyUIClient;
use crate::channel::{ChannelSupervisor, ReconnectConfig};
use crate::completion::{CompletionRegistry, CompletionWaiter};

/// How long `shutdown` waits for the connection task to exit.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection settings for a [`PipelineClient`].
#[derive(Debug, Clone)]
pub struct PipelineClientConfig {
    /// Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    pub api_url: String,
    /// Base WebSocket URL, e.g. `ws://127.0.0.1:8188`.
    pub ws_url: String,
    /// How long `submit` waits for the push channel to be connected.
    pub connect_grace: Duration,
    pub reconnect: ReconnectConfig,
}

impl PipelineClientConfig {
    /// Build a config for a plain `host:port` server address.
    pub fn from_address(address: &str) -> Self {
        Self {
            api_url: format!("http://{address}"),
            ws_url: format!("ws://{address}"),
            connect_grace: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Client for one ComfyUI server, shared by all in-flight jobs.
pub struct PipelineClient {
    client: Arc<ComfyUIClient>,
    api: Arc<ComfyUIApi>,
    registry: Arc<CompletionRegistry>,
    connected: watch::Receiver<bool>,
    connect_grace: Duration,
    /// Cancelled during shutdown.
    cancel: CancellationToken,
    task_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PipelineClient {
    /// Spawn the connection task and return a shared handle.
    ///
    /// Does not wait for the first connection; [`PipelineClient::submit`]
    /// waits up to the configured grace period instead.
    pub fn start(config: PipelineClientConfig) -> Arc<Self> {
        let client = Arc::new(ComfyUIClient::new(config.ws_url));
        let api = Arc::new(ComfyUIApi::new(config.api_url));
        let registry = Arc::new(CompletionRegistry::new());
        let cancel = CancellationToken::new();
        let (connected_tx, connected) = watch::channel(false);

        let supervisor = ChannelSupervisor {
            client: Arc::clone(&client),
            api: Arc::clone(&api),
            registry: Arc::clone(&registry),
            connected: connected_tx,
            reconnect: config.reconnect,
            cancel: cancel.clone(),
        };
        let task_handle = tokio::spawn(supervisor.run());

        Arc::new(Self {
            client,
            api,
            registry,
            connected,
            connect_grace: config.connect_grace,
            cancel,
            task_handle: Mutex::new(Some(task_handle)),
        })
    }

    /// The client id announced on the push channel and sent with every prompt.
    pub fn client_id(&self) -> &str {
        self.client.client_id()
    }

    /// Whether the push channel is currently up.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Upload a staged input file; returns the backend's asset name.
    pub async fn upload(&self, path: &Path) -> Result<String, PipelineClientError> {
        let response = self.api.upload_image(path).await?;
        tracing::debug!(
            name = %response.name,
            subfolder = %response.subfolder,
            kind = %response.kind,
            "Uploaded input image",
        );
        Ok(response.name)
    }

    /// Queue `workflow` under `prompt_id` and return a waiter for its completion.
    ///
    /// The prompt is registered before it is queued, so the completion
    /// event cannot arrive ahead of the registration. Dropping the
    /// returned waiter deregisters it.
    pub async fn submit(
        &self,
        workflow: &Value,
        prompt_id: &str,
    ) -> Result<CompletionWaiter, PipelineClientError> {
        self.wait_until_connected().await?;

        let waiter = self.registry.register(prompt_id);
        match self
            .api
            .submit_workflow(workflow, self.client_id(), prompt_id)
            .await
        {
            Ok(response) => {
                tracing::info!(
                    prompt_id = %response.prompt_id,
                    queue_number = response.number,
                    "Workflow submitted to ComfyUI",
                );
                Ok(waiter)
            }
            Err(e) if e.is_unreachable() => Err(PipelineClientError::ServiceUnavailable(e.to_string())),
            Err(e) => Err(PipelineClientError::Transport(e)),
        }
    }

    /// Stop the connection task and abandon every pending waiter.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down pipeline client");
        self.cancel.cancel();
        self.registry.clear();

        if let Some(handle) = self.task_handle.lock().await.take() {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await.is_err() {
                tracing::warn!("Connection task did not exit in time");
            }
        }

        tracing::info!("Pipeline client shut down complete");
    }

    // ---- private helpers ----

    async fn wait_until_connected(&self) -> Result<(), PipelineClientError> {
        let mut connected = self.connected.clone();
        let up = async { connected.wait_for(|up| *up).await.map(|_| ()) };
        match tokio::time::timeout(self.connect_grace, up).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PipelineClientError::ServiceUnavailable(
                "pipeline client is shut down".to_string(),
            )),
            Err(_) => Err(PipelineClientError::ServiceUnavailable(format!(
                "push channel to {} not connected after {}s",
                self.client.ws_url(),
                self.connect_grace.as_secs()
            ))),
        }
    }
}

/// Errors from the pipeline client.
#[derive(Debug, thiserror::Error)]
pub enum PipelineClientError {
    /// The backend answered with an error, or the exchange itself failed.
    #[error(transparent)]
    Transport(#[from] ComfyUIApiError),

    /// The backend is not reachable or the push channel is down.
    #[error("Pipeline backend unavailable: {0}")]
    ServiceUnavailable(String),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn from_address_builds_both_urls() {
        let config = PipelineClientConfig::from_address("comfy:8188");
        assert_eq!(config.api_url, "http://comfy:8188");
        assert_eq!(config.ws_url, "ws://comfy:8188");
    }

    #[tokio::test]
    async fn submit_without_connection_is_unavailable() {
        let mut config = PipelineClientConfig::from_address("127.0.0.1:9");
        config.connect_grace = Duration::from_millis(50);
        let client = PipelineClient::start(config);

        let result = client.submit(&json!({}), "p1").await;
        assert_matches!(result, Err(PipelineClientError::ServiceUnavailable(_)));
        assert!(!client.is_connected());

        client.shutdown().await;
    }
}
