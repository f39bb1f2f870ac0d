//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum. Fields that differ
//! between ComfyUI releases are optional so older and newer servers
//! parse the same way.

use serde::Deserialize;
use serde_json::Value;

/// All ComfyUI WebSocket message types the client reacts to.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, session id).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptRef),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is executing (`node: None` once the prompt is done).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step-level progress from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Every node of the prompt finished.
    #[serde(rename = "execution_success")]
    ExecutionSuccess(PromptRef),

    /// A node raised during execution.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    /// The prompt was interrupted (user or `/interrupt`).
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(ErrorData),

    /// Generic server-side error frame.
    #[serde(rename = "error")]
    Error(ErrorData),
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
    /// Session id, sent with the first status frame after connecting.
    #[serde(default)]
    pub sid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload carrying only the prompt id.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub display_node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: u32,
    pub max: u32,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    #[serde(default)]
    pub display_node: Option<String>,
    /// Raw output value, e.g. `{"images": [{"filename": ..., "subfolder": ..., "type": ...}]}`.
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub prompt_id: String,
}

/// Payload for `execution_error`, `execution_interrupted` and `error` frames.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ErrorData {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    #[serde(default)]
    pub exception_type: Option<String>,
    #[serde(default)]
    pub exception_message: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ErrorData {
    /// Human-readable error text, preferring the exception message.
    pub fn describe(&self) -> String {
        let text = self
            .exception_message
            .as_deref()
            .or(self.message.as_deref())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or("Unknown engine error");
        match (&self.exception_type, &self.node_type) {
            (Some(kind), Some(node)) => format!("{kind} in {node}: {text}"),
            (Some(kind), None) => format!("{kind}: {text}"),
            _ => text.to_string(),
        }
    }
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values; callers
/// should log and continue. Bare `error` frames that carry their text
/// at the top level (`{"type": "error", "message": "..."}`) are folded
/// into the same [`ErrorData`] shape as the others.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let mut value: Value = serde_json::from_str(text)?;
    if value.get("type").and_then(Value::as_str) == Some("error") && value.get("data").is_none() {
        let message = value.get("message").cloned().unwrap_or(Value::Null);
        value["data"] = serde_json::json!({ "message": message });
    }
    serde_json::from_value(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn status_with_session_id() {
        let json = r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":2}},"sid":"abc"}}"#;
        assert_matches!(
            parse_message(json).unwrap(),
            ComfyUIMessage::Status(data) if data.status.exec_info.queue_remaining == 2
                && data.sid.as_deref() == Some("abc")
        );
    }

    #[test]
    fn cached_nodes_default_to_empty() {
        let json = r#"{"type":"execution_cached","data":{"prompt_id":"p"}}"#;
        assert_matches!(
            parse_message(json).unwrap(),
            ComfyUIMessage::ExecutionCached(data) if data.nodes.is_empty()
        );
    }

    #[test]
    fn progress_carries_node_when_present() {
        let json = r#"{"type":"progress","data":{"value":3,"max":20,"node":"3","prompt_id":"p"}}"#;
        let ComfyUIMessage::Progress(data) = parse_message(json).unwrap() else {
            panic!("expected progress");
        };
        assert_eq!((data.value, data.max), (3, 20));
        assert_eq!(data.node.as_deref(), Some("3"));
    }

    #[test]
    fn progress_without_node_still_parses() {
        let json = r#"{"type":"progress","data":{"value":1,"max":4}}"#;
        assert_matches!(
            parse_message(json).unwrap(),
            ComfyUIMessage::Progress(data) if data.node.is_none()
        );
    }

    #[test]
    fn executing_done_marker_has_no_node() {
        let json = r#"{"type":"executing","data":{"node":null,"prompt_id":"p"}}"#;
        assert_matches!(
            parse_message(json).unwrap(),
            ComfyUIMessage::Executing(data) if data.node.is_none()
        );
    }

    #[test]
    fn executed_keeps_display_node_and_output() {
        let json = r#"{"type":"executed","data":{"node":"9","display_node":"9","output":{"images":[{"filename":"a.png","subfolder":"","type":"output"}]},"prompt_id":"p"}}"#;
        let ComfyUIMessage::Executed(data) = parse_message(json).unwrap() else {
            panic!("expected executed");
        };
        assert_eq!(data.node, "9");
        assert_eq!(data.display_node.as_deref(), Some("9"));
        assert_eq!(data.output["images"][0]["filename"], "a.png");
    }

    #[test]
    fn execution_error_describes_exception() {
        let json = r#"{"type":"execution_error","data":{"prompt_id":"p","node_id":"5","node_type":"KSampler","exception_message":"out of memory","exception_type":"RuntimeError"}}"#;
        let ComfyUIMessage::ExecutionError(data) = parse_message(json).unwrap() else {
            panic!("expected execution_error");
        };
        assert_eq!(data.node_id.as_deref(), Some("5"));
        assert_eq!(data.describe(), "RuntimeError in KSampler: out of memory");
    }

    #[test]
    fn bare_error_frame_uses_top_level_message() {
        let json = r#"{"type":"error","message":"prompt rejected"}"#;
        let ComfyUIMessage::Error(data) = parse_message(json).unwrap() else {
            panic!("expected error");
        };
        assert_eq!(data.describe(), "prompt rejected");
    }

    #[test]
    fn error_without_text_has_fallback_description() {
        assert_eq!(ErrorData::default().describe(), "Unknown engine error");
    }

    #[test]
    fn extension_message_types_are_rejected() {
        let json = r#"{"type":"crystools.monitor","data":{"cpu_utilization":12}}"#;
        assert!(parse_message(json).is_err());
    }
}
