//! Typed views of the `/history/{prompt_id}` and `/queue` responses.
//!
//! History entries are only partially structured by ComfyUI: node outputs
//! carry whatever keys the node chose to emit. Only the media-bearing keys
//! are modelled here; everything else is ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// One execution's entry in `/history/{prompt_id}`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HistoryEntry {
    /// Node id -> produced files. Sorted so extraction order is stable.
    #[serde(default)]
    pub outputs: BTreeMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Files a single output node produced.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<OutputFile>,
    #[serde(default)]
    pub gifs: Vec<OutputFile>,
    #[serde(default)]
    pub videos: Vec<OutputFile>,
    /// Set by animated image savers (`SaveAnimatedWEBP`, ...).
    #[serde(default)]
    pub animated: Vec<bool>,
}

impl NodeOutput {
    pub fn is_animated(&self) -> bool {
        self.animated.iter().any(|a| *a)
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.gifs.is_empty() && self.videos.is_empty()
    }
}

/// A file reference as accepted by `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output`, `temp` or `input`.
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

impl OutputFile {
    pub fn output(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            subfolder: String::new(),
            folder_type: default_folder_type(),
        }
    }

    /// Temporary preview files are evicted by the engine and are only a
    /// last resort.
    pub fn is_temp(&self) -> bool {
        self.folder_type == "temp"
    }
}

/// Execution status block of a history entry.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: Option<String>,
    #[serde(default)]
    pub completed: bool,
    /// `[[event_name, data], ...]` in execution order.
    #[serde(default)]
    pub messages: Vec<Value>,
}

impl HistoryStatus {
    pub fn is_error(&self) -> bool {
        self.status_str.as_deref() == Some("error")
            || self.messages.iter().any(|m| message_event(m) == Some("execution_error"))
    }

    /// The engine's error message, from the `execution_error` event.
    pub fn error_message(&self) -> Option<String> {
        self.messages
            .iter()
            .find(|m| message_event(m) == Some("execution_error"))
            .and_then(|m| m.get(1))
            .map(|data| {
                let message = data
                    .get("exception_message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error");
                match data.get("node_type").and_then(Value::as_str) {
                    Some(node_type) => format!("{node_type}: {message}"),
                    None => message.to_string(),
                }
            })
    }
}

fn message_event(message: &Value) -> Option<&str> {
    message.get(0).and_then(Value::as_str)
}

/// Extract the entry for `prompt_id` from a raw `/history/{id}` body.
///
/// ComfyUI answers `{}` while the prompt is still queued or running.
pub fn parse_history(body: &Value, prompt_id: &str) -> Result<Option<HistoryEntry>, serde_json::Error> {
    match body.get(prompt_id) {
        Some(entry) => serde_json::from_value(entry.clone()).map(Some),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Prompt ids currently executing and waiting, from `GET /queue`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    /// In execution order.
    pub pending: Vec<String>,
}

impl QueueSnapshot {
    /// Parse the raw body: each list holds `[number, prompt_id, prompt, ...]`
    /// rows. Pending rows are sorted by their queue number.
    pub fn from_json(body: &Value) -> Self {
        let running = rows(body.get("queue_running"))
            .into_iter()
            .map(|(_, id)| id)
            .collect();
        let mut pending = rows(body.get("queue_pending"));
        pending.sort_by_key(|(number, _)| *number);
        Self {
            running,
            pending: pending.into_iter().map(|(_, id)| id).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty() && self.pending.is_empty()
    }

    pub fn is_running(&self, prompt_id: &str) -> bool {
        self.running.iter().any(|id| id == prompt_id)
    }

    /// Zero-based position of `prompt_id` among pending prompts.
    pub fn pending_position(&self, prompt_id: &str) -> Option<usize> {
        self.pending.iter().position(|id| id == prompt_id)
    }
}

fn rows(list: Option<&Value>) -> Vec<(i64, String)> {
    list.and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|row| {
            let number = row.get(0).and_then(Value::as_i64).unwrap_or(0);
            let id = row.get(1).and_then(Value::as_str)?;
            Some((number, id.to_string()))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
