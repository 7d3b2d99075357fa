//! dock-backend: transports to the portfolio agent service.
//!
//! This crate opens the agent's incremental answer stream over HTTP, decodes
//! its newline-delimited JSON events and provides the single-shot fallback
//! request, plus an in-process mock of both for tests.

pub mod client;
pub mod error;
pub mod mock;
pub mod ndjson;
pub mod transport;

pub use client::{AgentClient, ClientOptions};
pub use error::TransportError;
pub use mock::{MockConfig, MockResponse, MockTransport};
pub use transport::{cancellable, EventStream, FallbackTransport, StreamTransport};
