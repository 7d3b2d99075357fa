//! Request and response bodies for the agent endpoints.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Body sent to both the stream and the fallback endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AskRequest {
    pub question: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl AskRequest {
    pub fn new(question: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            session_id: session_id.into(),
            system_prompt: None,
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: Option<String>) -> Self {
        self.system_prompt = system_prompt;
        self
    }
}

/// Complete answer returned by the non-streaming `/ask` endpoint.
///
/// The backend sends richer source records than the client renders, so
/// sources are kept as raw JSON values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AskResponse {
    #[serde(default)]
    pub answer: String,
    #[serde(default)]
    pub sources: Vec<Value>,
}

impl AskResponse {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            sources: Vec::new(),
        }
    }
}
