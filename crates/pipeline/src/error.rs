//! Error types for every pipeline stage.
//!
//! Component errors stay narrow; [`PipelineError`] is what a job fails with
//! and what the orchestrator reports back to the queue.

use kiln_comfyui::api::ComfyUIApiError;
use kiln_comfyui::client::ComfyUIClientError;
use kiln_core::error::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Invalid template '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("Failed to read template '{name}': {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl TemplateError {
    pub(crate) fn invalid(name: &str, reason: impl std::fmt::Display) -> Self {
        Self::Invalid {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// The template has no node the compiler knows how to parameterise.
    #[error("Unsupported template: none of its {node_count} nodes are recognised")]
    UnsupportedTemplate { node_count: usize },

    #[error(transparent)]
    Graph(#[from] CoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error(transparent)]
    Stream(#[from] ComfyUIClientError),

    /// The engine accepted the request but refused the workflow.
    #[error("Engine rejected workflow: {0}")]
    Rejected(String),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The queue refused a submission (aborted job, unknown id). Drop and
    /// continue.
    #[error("Queue rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Queue API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Unexpected queue response: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Upload request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload rejected ({status}): {body}")]
    Upload { status: u16, body: String },
}

/// Why a job did not produce a delivered result. Every variant ends the
/// job; nothing is retried inside the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error("Source image staging failed: {0}")]
    Staging(String),

    #[error("Submission failed: {0}")]
    Submit(#[source] EngineError),

    #[error("Timed out after {elapsed_secs}s")]
    TimedOut { elapsed_secs: u64 },

    #[error("Engine reported failure: {0}")]
    Failed(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("No usable artifact: {0}")]
    NoArtifact(String),
}

impl PipelineError {
    /// Short machine-readable label for logs and fault reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Template(TemplateError::NotFound(_)) => "template_not_found",
            Self::Template(_) => "template_invalid",
            Self::Compile(_) => "unsupported_template",
            Self::Staging(_) => "staging",
            Self::Submit(_) => "submit",
            Self::TimedOut { .. } => "timed_out",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
            Self::NoArtifact(_) => "no_artifact",
        }
    }
}
