//! Application payloads carried inside encrypted envelopes.
//!
//! The plaintext of every envelope is a JSON [`RelayPayload`]: either a
//! `message/send` request or the response to one, linked by a correlation id.
//! Message bodies follow the A2A message shape (role + typed parts).

use serde::{Deserialize, Serialize};

/// JSON-RPC method name used for agent requests.
pub const MESSAGE_SEND: &str = "message/send";

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The requesting side.
    User,
    /// The answering agent.
    Agent,
}

/// A content part of an [`AgentMessage`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessagePart {
    /// Plain text.
    Text { text: String },
    /// Structured data.
    Data { data: serde_json::Value },
}

/// An A2A-style message exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    /// Unique message identifier (UUID v4).
    pub message_id: String,
    /// Author role.
    pub role: Role,
    /// Content parts, in order.
    pub parts: Vec<MessagePart>,
    /// Optional conversation identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_id: Option<String>,
}

impl AgentMessage {
    /// Create a message with a fresh id.
    pub fn new(role: Role, parts: Vec<MessagePart>) -> Self {
        Self {
            message_id: uuid::Uuid::new_v4().to_string(),
            role,
            parts,
            context_id: None,
        }
    }

    /// A single-part text message from the requesting side.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![MessagePart::Text { text: text.into() }])
    }

    /// A single-part text message from the answering agent.
    pub fn agent_text(text: impl Into<String>) -> Self {
        Self::new(Role::Agent, vec![MessagePart::Text { text: text.into() }])
    }

    /// Attach a conversation id.
    pub fn with_context(mut self, context_id: impl Into<String>) -> Self {
        self.context_id = Some(context_id.into());
        self
    }

    /// All text parts joined with newlines. Data parts are skipped.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Data { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Error detail attached to a response when the remote handler failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// The decrypted body of a relay event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayPayload {
    /// A request awaiting a response with the same `id`.
    Request {
        /// Correlation id.
        id: String,
        /// RPC method, normally [`MESSAGE_SEND`].
        method: String,
        message: AgentMessage,
    },
    /// The answer to a request.
    Response {
        /// Correlation id copied from the request.
        id: String,
        message: AgentMessage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },
}

impl RelayPayload {
    /// Build a `message/send` request with a fresh correlation id.
    pub fn request(message: AgentMessage) -> Self {
        Self::Request {
            id: uuid::Uuid::new_v4().to_string(),
            method: MESSAGE_SEND.to_string(),
            message,
        }
    }

    /// Correlation id of either variant.
    pub fn id(&self) -> &str {
        match self {
            Self::Request { id, .. } | Self::Response { id, .. } => id,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(json)
    }
}
