//! Core types for the a2a-relay transport.
//!
//! This crate defines the data shared between the wire layer and its
//! consumers: the error taxonomy, the transport configuration, and the
//! application-level message payloads carried inside encrypted envelopes.
//! It contains no networking or cryptography.

pub mod config;
pub mod error;
pub mod message;

pub use config::TransportConfig;
pub use message::{AgentMessage, MessagePart, RelayPayload, Role};
