//! Supervision of the shared push channel.
//!
//! A single [`ChannelSupervisor`] task per [`PipelineClient`] keeps the
//! WebSocket up. Each cycle it connects (retrying on a capped exponential
//! [`Backoff`]), publishes `true` on the `connected` watch, reconciles
//! prompts that may have ended while the channel was down, and then
//! feeds frames to the processor until the socket drops.
//!
//! [`PipelineClient`]: crate::manager::PipelineClient

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;
use crate::client::{ComfyUIClient, ComfyUIConnection};
use crate::completion::CompletionRegistry;
use crate::messages::history_outcome;
use crate::processor::process_messages;

/// Tunable parameters for the reconnect backoff.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Delay schedule between failed connection attempts.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current = config.initial_delay;
        Self { config, current }
    }

    /// The delay to wait now; grows the schedule up to `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.config.max_delay);
        let grown_ms = (self.current.as_millis() as f64 * self.config.multiplier) as u64;
        self.current = Duration::from_millis(grown_ms).min(self.config.max_delay);
        delay
    }

    /// Start over from `initial_delay` after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
    }
}

/// Owns the connect, reconcile and process cycle for one client.
pub(crate) struct ChannelSupervisor {
    pub(crate) client: Arc<ComfyUIClient>,
    pub(crate) api: Arc<ComfyUIApi>,
    pub(crate) registry: Arc<CompletionRegistry>,
    pub(crate) connected: watch::Sender<bool>,
    pub(crate) reconnect: ReconnectConfig,
    pub(crate) cancel: CancellationToken,
}

impl ChannelSupervisor {
    /// Run until cancelled.
    pub(crate) async fn run(self) {
        let client_id = self.client.client_id().to_string();
        tracing::info!(client_id = %client_id, "Push channel supervisor started");

        let mut backoff = Backoff::new(self.reconnect.clone());
        while let Some(conn) = self.connect(&mut backoff).await {
            backoff.reset();
            self.connected.send_replace(true);

            let mut ws_stream = conn.ws_stream;
            let cancelled = tokio::select! {
                _ = self.cancel.cancelled() => true,
                _ = async {
                    self.reconcile_pending().await;
                    process_messages(&mut ws_stream, &self.registry).await;
                } => false,
            };

            self.connected.send_replace(false);
            if cancelled || self.cancel.is_cancelled() {
                break;
            }
            tracing::info!(
                client_id = %client_id,
                pending = self.registry.len(),
                "Push channel lost, reconnecting",
            );
        }

        tracing::info!(client_id = %client_id, "Push channel supervisor stopped");
    }

    /// Connect, sleeping on `backoff` between failures. `None` once cancelled.
    async fn connect(&self, backoff: &mut Backoff) -> Option<ComfyUIConnection> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.client.connect() => result,
            };

            match result {
                Ok(conn) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "Push channel restored");
                    }
                    return Some(conn);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Push channel connect failed",
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Resolve pending prompts that ended while the channel was down.
    ///
    /// A failed lookup leaves that prompt pending and moves on.
    async fn reconcile_pending(&self) {
        for prompt_id in self.registry.pending() {
            let history = match self.api.get_history(&prompt_id).await {
                Ok(history) => history,
                Err(e) => {
                    tracing::warn!(prompt_id = %prompt_id, error = %e, "History lookup failed");
                    continue;
                }
            };
            if let Some(outcome) = history_outcome(&prompt_id, &history) {
                tracing::info!(prompt_id = %prompt_id, ?outcome, "Prompt finished while disconnected");
                self.registry.resolve(&prompt_id, outcome);
            }
        }
    }
}
