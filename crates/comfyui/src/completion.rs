//! Per-prompt completion tracking.
//!
//! Many jobs share one WebSocket connection, and ComfyUI pushes events
//! for all of them down the same socket. Each job registers its prompt
//! id here *before* queuing the prompt and receives a
//! [`CompletionWaiter`]; the message processor resolves waiters as the
//! matching sentinel events arrive. Events for prompt ids nobody is
//! waiting on are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

/// How a prompt ended, as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// The backend reported nothing left to execute for the prompt.
    Finished,
    /// The backend reported an execution error or interruption.
    Failed(String),
}

/// Errors returned by [`CompletionWaiter::wait`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitError {
    #[error("Timed out after {}s waiting for the pipeline to finish", .0.as_secs())]
    TimedOut(Duration),

    #[error("Pipeline execution failed: {0}")]
    Failed(String),

    /// The registry dropped the waiter (client shut down).
    #[error("Pipeline client shut down before the prompt finished")]
    Abandoned,
}

type WaiterMap = HashMap<String, (u64, oneshot::Sender<CompletionOutcome>)>;

/// Registry of prompts awaiting their completion event.
#[derive(Debug, Default)]
pub struct CompletionRegistry {
    waiters: Mutex<WaiterMap>,
    next_token: AtomicU64,
}

impl CompletionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `prompt_id`.
    ///
    /// Registering the same id twice abandons the earlier waiter.
    pub fn register(self: &Arc<Self>, prompt_id: impl Into<String>) -> CompletionWaiter {
        let prompt_id = prompt_id.into();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(prompt_id.clone(), (token, tx));
        CompletionWaiter {
            prompt_id,
            token,
            rx,
            registry: Arc::clone(self),
        }
    }

    /// Deliver `outcome` to the waiter for `prompt_id`.
    ///
    /// Returns `false` if nobody is waiting on that prompt.
    pub fn resolve(&self, prompt_id: &str, outcome: CompletionOutcome) -> bool {
        match self.lock().remove(prompt_id) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Prompt ids currently awaiting completion, in id order.
    pub fn pending(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drop every waiter; each observes [`WaitError::Abandoned`].
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Remove the entry for `prompt_id` only if it still belongs to `token`.
    fn remove(&self, prompt_id: &str, token: u64) {
        let mut waiters = self.lock();
        if waiters.get(prompt_id).is_some_and(|(t, _)| *t == token) {
            waiters.remove(prompt_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, WaiterMap> {
        // Critical sections never panic midway, so a poisoned map is still consistent.
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle for one registered prompt. Deregisters itself when dropped.
#[derive(Debug)]
pub struct CompletionWaiter {
    prompt_id: String,
    token: u64,
    rx: oneshot::Receiver<CompletionOutcome>,
    registry: Arc<CompletionRegistry>,
}

impl CompletionWaiter {
    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Wait for the prompt's completion event, up to `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<(), WaitError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Err(_) => Err(WaitError::TimedOut(timeout)),
            Ok(Err(_)) => Err(WaitError::Abandoned),
            Ok(Ok(CompletionOutcome::Finished)) => Ok(()),
            Ok(Ok(CompletionOutcome::Failed(reason))) => Err(WaitError::Failed(reason)),
        }
    }
}

impl Drop for CompletionWaiter {
    fn drop(&mut self) {
        self.registry.remove(&self.prompt_id, self.token);
    }
}
