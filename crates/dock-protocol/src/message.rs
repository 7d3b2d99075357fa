//! Events emitted by the agent's chat stream.
//!
//! The stream endpoint answers with newline-delimited JSON; every line is one
//! [`StreamEvent`] tagged by its `type` field.

use serde::{Deserialize, Serialize};

/// Token accounting reported with the final `end` event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: Option<u64>,
    #[serde(default)]
    pub completion_tokens: Option<u64>,
    #[serde(default)]
    pub total_tokens: Option<u64>,
}

/// One line of the agent chat stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// The server accepted the question and assigned a canonical message id.
    Start {
        message_id: String,
        #[serde(default)]
        created_at: Option<String>,
    },

    /// A fragment of answer text to append.
    Delta { content: String },

    /// The agent started running a tool.
    ToolStart {
        #[serde(default)]
        tool: Option<String>,
    },

    /// The running tool finished.
    ToolEnd,

    /// Normal completion.
    End {
        message_id: String,
        #[serde(default)]
        usage: Option<Usage>,
    },

    /// A failure reported by the server inside the stream.
    Error { message: String },
}

impl StreamEvent {
    pub fn delta(content: impl Into<String>) -> Self {
        Self::Delta {
            content: content.into(),
        }
    }

    pub fn start(message_id: impl Into<String>) -> Self {
        Self::Start {
            message_id: message_id.into(),
            created_at: None,
        }
    }

    pub fn end(message_id: impl Into<String>) -> Self {
        Self::End {
            message_id: message_id.into(),
            usage: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_start_line() {
        let line = r#"{"type":"start","message_id":"m1","created_at":"2025-01-01T00:00:00+00:00"}"#;
        let event: StreamEvent = serde_json::from_str(line).unwrap();
        assert_eq!(
            event,
            StreamEvent::Start {
                message_id: "m1".to_string(),
                created_at: Some("2025-01-01T00:00:00+00:00".to_string()),
            }
        );
    }

    #[test]
    fn parse_delta_with_cyrillic() {
        let line = r#"{"type":"delta","content":"применялся в..."}"#;
        let event: StreamEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event, StreamEvent::delta("применялся в..."));
    }

    #[test]
    fn parse_end_with_null_usage() {
        let line = r#"{"type":"end","message_id":"m1","usage":null}"#;
        let event: StreamEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event, StreamEvent::end("m1"));
    }

    #[test]
    fn parse_end_with_partial_usage() {
        let line = r#"{"type":"end","message_id":"m1","usage":{"prompt_tokens":12,"completion_tokens":null,"total_tokens":12}}"#;
        let event: StreamEvent = serde_json::from_str(line).unwrap();
        let StreamEvent::End { usage, .. } = event else {
            panic!("expected end event");
        };
        let usage = usage.unwrap();
        assert_eq!(usage.prompt_tokens, Some(12));
        assert_eq!(usage.completion_tokens, None);
        assert_eq!(usage.total_tokens, Some(12));
    }

    #[test]
    fn parse_tool_events() {
        let start: StreamEvent =
            serde_json::from_str(r#"{"type":"tool_start","tool":"search_projects"}"#).unwrap();
        assert_eq!(
            start,
            StreamEvent::ToolStart {
                tool: Some("search_projects".to_string())
            }
        );
        let end: StreamEvent = serde_json::from_str(r#"{"type":"tool_end"}"#).unwrap();
        assert_eq!(end, StreamEvent::ToolEnd);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = serde_json::from_str::<StreamEvent>(r#"{"type":"heartbeat"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn serialize_uses_snake_case_tag() {
        let json = serde_json::to_string(&StreamEvent::delta("hi")).unwrap();
        assert_eq!(json, r#"{"type":"delta","content":"hi"}"#);
    }
}
