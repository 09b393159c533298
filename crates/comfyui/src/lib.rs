//! ComfyUI WebSocket and REST client library.
//!
//! Provides a shared WebSocket push connection kept up by a supervisor
//! task, per-prompt completion tracking, and HTTP API wrappers for
//! uploading inputs and queuing workflows on a ComfyUI pipeline backend.

pub mod api;
pub mod channel;
pub mod client;
pub mod completion;
pub mod manager;
pub mod messages;
pub mod processor;
