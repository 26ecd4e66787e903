//! The engine seam.
//!
//! [`EngineClient`] is the request/response surface the pipeline needs from
//! a generation engine. [`ComfyUIEngine`] implements it over the ComfyUI
//! REST API, with the WebSocket used only for progress logging.

use std::collections::BTreeMap;

use async_trait::async_trait;
use kiln_comfyui::api::ComfyUIApi;
use kiln_comfyui::client::ComfyUIClient;
use kiln_comfyui::history::{HistoryEntry, NodeOutput, OutputFile, QueueSnapshot};
use kiln_comfyui::progress;
use kiln_core::hashing::sha256_hex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Identifies one submitted execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionHandle {
    /// Engine-assigned id (`prompt_id`).
    pub prompt_id: String,
    /// Client id the prompt was submitted under; progress frames are
    /// addressed to it.
    pub client_id: String,
}

/// One status observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStatus {
    pub completed: bool,
    pub outputs: BTreeMap<String, NodeOutput>,
    pub error: Option<String>,
    /// Fingerprint of the completed flag plus the message list. Unchanged
    /// signatures across polls mean no observable progress.
    pub signature: String,
}

impl EngineStatus {
    /// Status while the engine has no history for the prompt.
    pub fn pending() -> Self {
        Self::from_history(None)
    }

    pub fn from_history(entry: Option<HistoryEntry>) -> Self {
        let Some(entry) = entry else {
            return Self {
                signature: signature(false, &[]),
                ..Default::default()
            };
        };

        let status = entry.status.unwrap_or_default();
        let error = status.is_error().then(|| {
            status
                .error_message()
                .unwrap_or_else(|| "execution failed without a message".to_string())
        });

        Self {
            signature: signature(status.completed, &status.messages),
            completed: status.completed,
            outputs: entry.outputs,
            error,
        }
    }

    /// Whether any output node reported a media file.
    pub fn has_media(&self) -> bool {
        self.outputs.values().any(|o| !o.is_empty())
    }
}

fn signature(completed: bool, messages: &[Value]) -> String {
    let payload = serde_json::json!([completed, messages]);
    sha256_hex(payload.to_string().as_bytes())
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Queue an API-encoded workflow for execution.
    async fn submit(&self, workflow: &Value, client_id: &str) -> Result<ExecutionHandle, EngineError>;

    async fn status(&self, handle: &ExecutionHandle) -> Result<EngineStatus, EngineError>;

    async fn fetch_file(&self, file: &OutputFile) -> Result<Vec<u8>, EngineError>;

    async fn queue_state(&self) -> Result<QueueSnapshot, EngineError>;

    /// Store an image in the engine's input directory, returning the name
    /// it was stored under.
    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: &str,
    ) -> Result<String, EngineError>;

    /// Stop an execution: a queued one is removed, a running one is
    /// interrupted.
    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), EngineError>;

    /// Follow progress events until `cancel` fires or the execution ends.
    /// Purely observational; failures are logged, never returned.
    async fn watch_progress(&self, _handle: &ExecutionHandle, _cancel: CancellationToken) {}
}

// ---------------------------------------------------------------------------
// ComfyUI implementation
// ---------------------------------------------------------------------------

pub struct ComfyUIEngine {
    api: ComfyUIApi,
    ws: Option<ComfyUIClient>,
}

impl ComfyUIEngine {
    pub fn new(api: ComfyUIApi, ws: Option<ComfyUIClient>) -> Self {
        Self { api, ws }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }
}

#[async_trait]
impl EngineClient for ComfyUIEngine {
    async fn submit(&self, workflow: &Value, client_id: &str) -> Result<ExecutionHandle, EngineError> {
        let response = self.api.submit_workflow(workflow, client_id).await?;

        if response.node_errors.as_object().is_some_and(|errors| !errors.is_empty()) {
            return Err(EngineError::Rejected(response.node_errors.to_string()));
        }

        tracing::debug!(
            prompt_id = %response.prompt_id,
            queue_number = response.number,
            "Workflow queued",
        );

        Ok(ExecutionHandle {
            prompt_id: response.prompt_id,
            client_id: client_id.to_string(),
        })
    }

    async fn status(&self, handle: &ExecutionHandle) -> Result<EngineStatus, EngineError> {
        let entry = self.api.get_history(&handle.prompt_id).await?;
        Ok(EngineStatus::from_history(entry))
    }

    async fn fetch_file(&self, file: &OutputFile) -> Result<Vec<u8>, EngineError> {
        Ok(self.api.view_file(file).await?)
    }

    async fn queue_state(&self) -> Result<QueueSnapshot, EngineError> {
        Ok(self.api.get_queue().await?)
    }

    async fn upload_image(
        &self,
        bytes: Vec<u8>,
        filename: &str,
        content_type: &str,
    ) -> Result<String, EngineError> {
        let uploaded = self.api.upload_image(bytes, filename, content_type).await?;
        Ok(match uploaded.subfolder.as_str() {
            "" => uploaded.name,
            subfolder => format!("{subfolder}/{}", uploaded.name),
        })
    }

    async fn cancel(&self, handle: &ExecutionHandle) -> Result<(), EngineError> {
        let snapshot = self.api.get_queue().await?;
        match CancelAction::for_prompt(&snapshot, &handle.prompt_id) {
            CancelAction::Interrupt => {
                tracing::info!(prompt_id = %handle.prompt_id, "Interrupting running execution");
                self.api.interrupt().await?;
            }
            CancelAction::Delete => self.api.cancel_execution(&handle.prompt_id).await?,
            CancelAction::Nothing => {
                tracing::debug!(prompt_id = %handle.prompt_id, "Execution already left the queue");
            }
        }
        Ok(())
    }

    async fn watch_progress(&self, handle: &ExecutionHandle, cancel: CancellationToken) {
        let Some(ws) = &self.ws else {
            return;
        };

        let conn = tokio::select! {
            _ = cancel.cancelled() => return,
            conn = ws.connect(&handle.client_id) => conn,
        };

        let result = match conn {
            Ok(conn) => progress::listen(conn, &handle.prompt_id, cancel).await,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            tracing::debug!(
                prompt_id = %handle.prompt_id,
                error = %e,
                "Progress channel unavailable, relying on polling",
            );
        }
    }
}

/// How to stop a prompt given where the engine's queue has it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CancelAction {
    Interrupt,
    Delete,
    Nothing,
}

impl CancelAction {
    fn for_prompt(snapshot: &QueueSnapshot, prompt_id: &str) -> Self {
        if snapshot.is_running(prompt_id) {
            Self::Interrupt
        } else if snapshot.pending_position(prompt_id).is_some() {
            Self::Delete
        } else {
            Self::Nothing
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
