//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON text frames shaped `{"type": "<kind>", "data": {...}}`.
//! Frames of unknown kinds fail to parse; the progress listener logs and
//! skips them.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth).
    #[serde(rename = "status")]
    Status(StatusData),

    #[serde(rename = "execution_start")]
    ExecutionStart(PromptData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A node started executing; `node: None` means the prompt finished.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step progress inside a long-running node.
    #[serde(rename = "progress")]
    Progress(ProgressData),

    #[serde(rename = "executed")]
    Executed(ExecutedData),

    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptData),

    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(PromptData),

    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

impl ComfyUIMessage {
    /// The prompt this message is about, when it names one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::Status(_) => None,
            Self::Progress(d) => d.prompt_id.as_deref(),
            Self::ExecutionStart(d) | Self::ExecutionSuccess(d) | Self::ExecutionInterrupted(d) => {
                Some(&d.prompt_id)
            }
            Self::ExecutionCached(d) => Some(&d.prompt_id),
            Self::Executing(d) => d.prompt_id.as_deref(),
            Self::Executed(d) => Some(&d.prompt_id),
            Self::ExecutionError(d) => Some(&d.prompt_id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    /// Older servers omit this on the final `executing` frame.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i32,
    pub max: i32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

impl ProgressData {
    pub fn percent(&self) -> u8 {
        if self.max <= 0 {
            return 0;
        }
        ((f64::from(self.value) / f64::from(self.max)) * 100.0).clamp(0.0, 100.0) as u8
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    /// Raw node output (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Parse a ComfyUI WebSocket text frame.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn status_carries_queue_depth() {
        let msg = parse_message(
            r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":2}},"sid":"x"}}"#,
        )
        .unwrap();
        assert_matches!(msg, ComfyUIMessage::Status(d) if d.status.exec_info.queue_remaining == 2);
    }

    #[test]
    fn executing_finished_frame() {
        let msg = parse_message(r#"{"type":"executing","data":{"node":null,"prompt_id":"p"}}"#).unwrap();
        assert_eq!(msg.prompt_id(), Some("p"));
        assert_matches!(msg, ComfyUIMessage::Executing(ExecutingData { node: None, .. }));
    }

    #[test]
    fn progress_percent() {
        let msg = parse_message(
            r#"{"type":"progress","data":{"value":5,"max":20,"prompt_id":"p","node":"3"}}"#,
        )
        .unwrap();
        match msg {
            ComfyUIMessage::Progress(d) => {
                assert_eq!(d.percent(), 25);
                assert_eq!(d.node.as_deref(), Some("3"));
            }
            other => panic!("Expected Progress, got {other:?}"),
        }
    }

    #[test]
    fn progress_without_prompt_id() {
        let msg = parse_message(r#"{"type":"progress","data":{"value":1,"max":0}}"#).unwrap();
        assert_eq!(msg.prompt_id(), None);
        assert_matches!(msg, ComfyUIMessage::Progress(d) if d.percent() == 0);
    }

    #[test]
    fn execution_error_fields() {
        let msg = parse_message(
            r#"{"type":"execution_error","data":{"prompt_id":"p","node_id":"5","exception_message":"OOM","exception_type":"RuntimeError"}}"#,
        )
        .unwrap();
        assert_matches!(msg, ComfyUIMessage::ExecutionError(d) if d.exception_message == "OOM");
    }

    #[test]
    fn success_and_interrupt_frames() {
        let ok = parse_message(r#"{"type":"execution_success","data":{"prompt_id":"p"}}"#).unwrap();
        assert_matches!(ok, ComfyUIMessage::ExecutionSuccess(_));
        let stop =
            parse_message(r#"{"type":"execution_interrupted","data":{"prompt_id":"p","node_id":"3"}}"#)
                .unwrap();
        assert_eq!(stop.prompt_id(), Some("p"));
    }

    #[test]
    fn unknown_kind_and_garbage_are_errors() {
        assert!(parse_message(r#"{"type":"crystools.monitor","data":{}}"#).is_err());
        assert!(parse_message("not json").is_err());
    }
}
