//! Transcript entries shown to the user.

use serde::{Deserialize, Serialize};

/// Author of a transcript entry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Agent,
}

/// Lifecycle of an agent reply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Streaming,
    Done,
    Error,
    Stopped,
}

impl MessageStatus {
    /// Terminal statuses are never left again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, MessageStatus::Streaming)
    }
}

/// One entry of the conversation transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Unix epoch milliseconds.
    pub created_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

impl Message {
    pub fn user(id: impl Into<String>, content: impl Into<String>, created_at: u64) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            content: content.into(),
            created_at,
            status: None,
        }
    }

    /// An empty agent reply waiting for its first delta.
    pub fn agent_placeholder(id: impl Into<String>, created_at: u64) -> Self {
        Self {
            id: id.into(),
            role: Role::Agent,
            content: String::new(),
            created_at,
            status: Some(MessageStatus::Streaming),
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.status == Some(MessageStatus::Streaming)
    }
}
