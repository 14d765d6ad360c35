//! Encrypted agent-to-agent messaging over public relays.
//!
//! Agents that cannot reach each other directly exchange request/response
//! messages through append-only relay servers used as blind mailboxes:
//!
//! - [`identity`]: Ed25519 keypairs; an agent's identity is its hex public key.
//! - [`envelope`]: authenticated encryption between two identities.
//! - [`event`]: signed wire events as stored and forwarded by relays.
//! - [`protocol`]: the relay JSON frame format and subscription filters.
//! - [`relay`]: one reconnecting WebSocket link per relay.
//! - [`pending`]: in-flight requests keyed by correlation id.
//! - [`transport`]: the orchestrator tying it all together.

pub mod envelope;
pub mod event;
pub mod identity;
pub mod pending;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use a2a_relay_types::error::{EnvelopeError, IdentityError, RelayError, TransportError};
pub use a2a_relay_types::{AgentMessage, MessagePart, RelayPayload, Role, TransportConfig};
pub use envelope::Envelope;
pub use event::WireEvent;
pub use identity::{Keypair, PublicKey};
pub use protocol::Filter;
pub use relay::{LinkConfig, LinkEvent, LinkState, RelayLink};
pub use transport::{MessageHandler, RelayTransport};
