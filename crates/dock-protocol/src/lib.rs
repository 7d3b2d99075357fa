//! dock-protocol: Shared types for the AgentDock conversation client.
//!
//! This crate defines the wire events of the agent chat stream, the bodies
//! of the agent endpoints and the transcript entries the UI renders.

pub mod message;
pub mod request;
pub mod transcript;

pub use message::{StreamEvent, Usage};
pub use request::{AskRequest, AskResponse};
pub use transcript::{Message, MessageStatus, Role};
