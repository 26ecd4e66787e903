//! Best-effort progress listener.
//!
//! Reads frames from a ComfyUI WebSocket connection and logs the ones that
//! concern a single prompt. It exists purely for observability: completion
//! is always decided by history polling, so the listener never reports
//! results, only whether it stopped cleanly.

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClientError, ComfyUIConnection};
use crate::messages::{parse_message, ComfyUIMessage};

/// What the listener should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Continue,
    /// The prompt reached a terminal event; stop listening.
    Finished,
}

/// Listen until the prompt finishes, the socket closes, or `cancel` fires.
pub async fn listen(
    mut conn: ComfyUIConnection,
    prompt_id: &str,
    cancel: CancellationToken,
) -> Result<(), ComfyUIClientError> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = conn.ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                if observe(&text, prompt_id) == Observation::Finished {
                    break;
                }
            }
            Some(Ok(Message::Binary(_))) => {
                // Preview images.
                tracing::trace!(prompt_id, "Ignoring binary frame");
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::debug!(prompt_id, ?frame, "ComfyUI WebSocket closed");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                return Err(ComfyUIClientError::Protocol(e.to_string()));
            }
            None => break,
        }
    }

    let _ = conn.ws_stream.close(None).await;
    Ok(())
}

/// Log a single text frame if it concerns `prompt_id`.
pub fn observe(text: &str, prompt_id: &str) -> Observation {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::trace!(prompt_id, error = %e, "Skipping unrecognised ComfyUI frame");
            return Observation::Continue;
        }
    };

    if let ComfyUIMessage::Status(data) = &msg {
        tracing::trace!(
            queue_remaining = data.status.exec_info.queue_remaining,
            "ComfyUI queue status",
        );
        return Observation::Continue;
    }

    // Frames for other prompts share the socket when several jobs run.
    if msg.prompt_id().is_some_and(|id| id != prompt_id) {
        return Observation::Continue;
    }

    match msg {
        ComfyUIMessage::ExecutionStart(_) => {
            tracing::info!(prompt_id, "Execution started");
            Observation::Continue
        }
        ComfyUIMessage::ExecutionCached(data) => {
            tracing::debug!(prompt_id, cached_nodes = data.nodes.len(), "Execution used cache");
            Observation::Continue
        }
        ComfyUIMessage::Executing(data) => match data.node {
            Some(node) => {
                tracing::debug!(prompt_id, node = %node, "Executing node");
                Observation::Continue
            }
            None => {
                tracing::debug!(prompt_id, "All nodes done");
                Observation::Finished
            }
        },
        ComfyUIMessage::Progress(data) => {
            tracing::debug!(
                prompt_id,
                value = data.value,
                max = data.max,
                percent = data.percent(),
                "Generation progress",
            );
            Observation::Continue
        }
        ComfyUIMessage::Executed(data) => {
            tracing::debug!(prompt_id, node = %data.node, "Node produced output");
            Observation::Continue
        }
        ComfyUIMessage::ExecutionSuccess(_) => Observation::Finished,
        ComfyUIMessage::ExecutionInterrupted(_) => {
            tracing::warn!(prompt_id, "Execution interrupted");
            Observation::Finished
        }
        ComfyUIMessage::ExecutionError(data) => {
            tracing::warn!(
                prompt_id,
                node_id = ?data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error reported over WebSocket",
            );
            Observation::Finished
        }
        ComfyUIMessage::Status(_) => Observation::Continue,
    }
}
