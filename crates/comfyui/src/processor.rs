//! WebSocket message processing loop.
//!
//! Reads raw frames from the shared ComfyUI push connection and resolves
//! the matching waiters in the [`CompletionRegistry`]. Every in-flight
//! job shares the socket, so each event is routed by its `prompt_id`.

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;

use crate::client::ComfyUIStream;
use crate::completion::{CompletionOutcome, CompletionRegistry};
use crate::messages::PushEvent;

/// Process frames until the WebSocket closes or fails.
///
/// Binary frames (preview images) are ignored.
pub async fn process_messages(ws_stream: &mut ComfyUIStream, registry: &CompletionRegistry) {
    while let Some(msg_result) = ws_stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                handle_text_message(&text, registry);
            }
            Ok(Message::Binary(_)) => {
                tracing::trace!("Ignoring binary message (preview image)");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Handled automatically by tungstenite.
            }
            Ok(Message::Close(frame)) => {
                tracing::info!(?frame, "ComfyUI WebSocket closed");
                break;
            }
            Ok(Message::Frame(_)) => {}
            Err(e) => {
                tracing::error!(error = %e, "WebSocket receive error");
                break;
            }
        }
    }
}

/// Dispatch a single text frame.
pub fn handle_text_message(text: &str, registry: &CompletionRegistry) {
    let event = match PushEvent::parse(text) {
        Ok(event) => event,
        Err(e) => {
            tracing::trace!(error = %e, "Ignoring unrecognised ComfyUI message");
            return;
        }
    };

    let prompt_id = event.prompt_id();
    let Some(outcome) = event.outcome() else {
        tracing::debug!(prompt_id, "Executing node");
        return;
    };

    match &outcome {
        CompletionOutcome::Finished => {
            tracing::info!(prompt_id, "Execution completed (all nodes done)");
        }
        CompletionOutcome::Failed(reason) => {
            tracing::warn!(prompt_id, reason = %reason, "Execution failed");
        }
    }
    let delivered = registry.resolve(prompt_id, outcome);
    tracing::debug!(prompt_id, delivered, "Completion dispatched");
}
