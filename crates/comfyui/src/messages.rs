//! Push events that settle a prompt, and the history equivalent.
//!
//! ComfyUI pushes `{"type": "<kind>", "data": {...}}` frames for every
//! queued prompt. Only the kinds that end a prompt are modelled here;
//! everything else (status broadcasts, progress, cached nodes, previews)
//! fails to parse as a [`PushEvent`] and is ignored by the processor.

use serde::Deserialize;
use serde_json::Value;

use crate::completion::CompletionOutcome;

const INTERRUPTED: &str = "Execution was interrupted";

/// A push frame that concerns a prompt's completion.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PushEvent {
    /// A node started executing, or the prompt finished when `node` is null.
    Executing(ExecutingData),
    ExecutionError(ErrorData),
    ExecutionInterrupted(InterruptedData),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    pub prompt_id: String,
}

/// Exception report for a failed prompt.
///
/// Same shape in the `execution_error` push frame and in the history
/// entry's status messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    pub exception_message: String,
    pub exception_type: String,
}

impl ErrorData {
    /// Failure reason recorded on the job.
    pub fn describe(&self) -> String {
        format!(
            "{} in node {}: {}",
            self.exception_type, self.node_id, self.exception_message
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

impl PushEvent {
    /// Parse a text frame. Kinds not modelled here are an error.
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn prompt_id(&self) -> &str {
        match self {
            Self::Executing(data) => &data.prompt_id,
            Self::ExecutionError(data) => &data.prompt_id,
            Self::ExecutionInterrupted(data) => &data.prompt_id,
        }
    }

    /// How this event settles its prompt; `None` while nodes are still running.
    pub fn outcome(&self) -> Option<CompletionOutcome> {
        match self {
            Self::Executing(data) => data.node.is_none().then_some(CompletionOutcome::Finished),
            Self::ExecutionError(data) => Some(CompletionOutcome::Failed(data.describe())),
            Self::ExecutionInterrupted(_) => Some(CompletionOutcome::Failed(INTERRUPTED.to_string())),
        }
    }
}

/// Interpret a `GET /history/{prompt_id}` response.
///
/// Returns `None` while the prompt is still queued or running (no entry
/// yet, or an entry not marked completed).
pub fn history_outcome(prompt_id: &str, history: &Value) -> Option<CompletionOutcome> {
    let entry = history.get(prompt_id)?;
    let Some(status) = entry.get("status") else {
        // Older servers only add an entry once the prompt is done.
        return Some(CompletionOutcome::Finished);
    };

    if status.get("status_str").and_then(Value::as_str) == Some("error") {
        let reason = status
            .get("messages")
            .and_then(Value::as_array)
            .and_then(|messages| {
                messages.iter().find_map(|m| {
                    if m.get(0)?.as_str()? != "execution_error" {
                        return None;
                    }
                    serde_json::from_value::<ErrorData>(m.get(1)?.clone()).ok()
                })
            })
            .map(|data| data.describe())
            .unwrap_or_else(|| "Pipeline reported an execution error".to_string());
        return Some(CompletionOutcome::Failed(reason));
    }

    match status.get("completed").and_then(Value::as_bool) {
        Some(true) => Some(CompletionOutcome::Finished),
        _ => None,
    }
}
