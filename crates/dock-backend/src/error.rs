use std::time::Duration;

use thiserror::Error;

/// Failures of the stream and fallback transports.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The caller cancelled the request. Not a failure of the agent.
    #[error("request cancelled")]
    Cancelled,
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("agent returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("agent response has no body")]
    MissingBody,
    #[error("stream interrupted: {0}")]
    Body(#[source] reqwest::Error),
    #[error("invalid agent response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("agent unreachable: {0}")]
    Unreachable(String),
    #[error("no data from agent for {}s", .0.as_secs())]
    IdleTimeout(Duration),
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled)
    }
}
