//! dock-core: conversation controller for the AgentDock client.
//!
//! This crate holds the session identity, the character pacer, the
//! conversation state machine and the async dock that drives it.
//! Exposed as a library for integration testing.

pub mod config;
pub mod conversation;
pub mod dock;
pub mod logging;
pub mod pacer;
pub mod render;
pub mod session;

pub use conversation::{Conversation, Notices, Phase};
pub use dock::{AgentDock, DockHandle, DockOptions, DockSnapshot};
pub use pacer::{CharacterPacer, PacerConfig};
pub use session::SessionId;
