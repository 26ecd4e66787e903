//! ComfyUI REST and WebSocket client library.
//!
//! Provides the HTTP API wrapper used for submission, history polling,
//! queue inspection and file transfer, typed history/queue responses, and
//! the WebSocket message parser plus a best-effort progress listener.

pub mod api;
pub mod client;
pub mod history;
pub mod messages;
pub mod progress;
