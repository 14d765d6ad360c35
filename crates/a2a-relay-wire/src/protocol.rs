//! Relay wire protocol: JSON arrays, one per WebSocket text frame.
//!
//! Client → relay: `["REQ", sub_id, filter]`, `["CLOSE", sub_id]`,
//! `["EVENT", event]`.
//! Relay → client: `["EVENT", sub_id, event]`, `["EOSE", sub_id]`,
//! `["OK", event_id, accepted, reason]`, `["NOTICE", message]`.

use crate::event::{WireEvent, TAG_RECIPIENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Subscription filter. Empty fields are omitted on the wire and match
/// anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kinds: Vec<u32>,
    /// Values of the `p` (recipient) tag.
    #[serde(rename = "#p", default, skip_serializing_if = "Vec::is_empty")]
    pub recipients: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, kind: u32) -> Self {
        self.kinds.push(kind);
        self
    }

    pub fn recipient(mut self, identity: impl Into<String>) -> Self {
        self.recipients.push(identity.into());
        self
    }

    pub fn author(mut self, identity: impl Into<String>) -> Self {
        self.authors.push(identity.into());
        self
    }

    pub fn id(mut self, event_id: impl Into<String>) -> Self {
        self.ids.push(event_id.into());
        self
    }

    pub fn since(mut self, timestamp: i64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes every non-empty field of this filter.
    /// `limit` only bounds stored-event replay and is not checked here.
    pub fn matches(&self, event: &WireEvent) -> bool {
        if !self.ids.is_empty() && !self.ids.contains(&event.id) {
            return false;
        }
        if !self.authors.is_empty() && !self.authors.contains(&event.pubkey) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&event.kind) {
            return false;
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if !self.recipients.is_empty() {
            let tagged = event.tags.iter().any(|t| {
                t.first().map(String::as_str) == Some(TAG_RECIPIENT)
                    && t.get(1).is_some_and(|v| self.recipients.contains(v))
            });
            if !tagged {
                return false;
            }
        }
        true
    }
}

/// A frame sent from client to relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Req { sub_id: String, filter: Filter },
    Close { sub_id: String },
    Event(WireEvent),
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Req { sub_id, filter } => serde_json::json!(["REQ", sub_id, filter]),
            Self::Close { sub_id } => serde_json::json!(["CLOSE", sub_id]),
            Self::Event(event) => serde_json::json!(["EVENT", event]),
        };
        value.to_string()
    }

    /// Parse a client frame. Used by relays and tests; returns `None` for
    /// anything malformed.
    pub fn parse(text: &str) -> Option<Self> {
        let frame: Vec<Value> = serde_json::from_str(text).ok()?;
        match frame.first()?.as_str()? {
            "REQ" => Some(Self::Req {
                sub_id: frame.get(1)?.as_str()?.to_string(),
                filter: serde_json::from_value(frame.get(2)?.clone()).ok()?,
            }),
            "CLOSE" => Some(Self::Close {
                sub_id: frame.get(1)?.as_str()?.to_string(),
            }),
            "EVENT" => Some(Self::Event(
                serde_json::from_value(frame.get(1)?.clone()).ok()?,
            )),
            _ => None,
        }
    }
}

/// A frame received from a relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, event: WireEvent },
    Eose { sub_id: String },
    Ok {
        event_id: String,
        accepted: bool,
        message: String,
    },
    Notice { message: String },
}

impl RelayMessage {
    /// Parse a relay frame. Malformed frames and unknown message types
    /// yield `None` and are meant to be dropped.
    pub fn parse(text: &str) -> Option<Self> {
        let frame: Vec<Value> = serde_json::from_str(text).ok()?;
        match frame.first()?.as_str()? {
            "EVENT" => Some(Self::Event {
                sub_id: frame.get(1)?.as_str()?.to_string(),
                event: serde_json::from_value(frame.get(2)?.clone()).ok()?,
            }),
            "EOSE" => Some(Self::Eose {
                sub_id: frame.get(1)?.as_str()?.to_string(),
            }),
            "OK" => Some(Self::Ok {
                event_id: frame.get(1)?.as_str()?.to_string(),
                accepted: frame.get(2)?.as_bool()?,
                message: frame
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            }),
            "NOTICE" => Some(Self::Notice {
                message: frame.get(1)?.as_str()?.to_string(),
            }),
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        let value = match self {
            Self::Event { sub_id, event } => serde_json::json!(["EVENT", sub_id, event]),
            Self::Eose { sub_id } => serde_json::json!(["EOSE", sub_id]),
            Self::Ok {
                event_id,
                accepted,
                message,
            } => serde_json::json!(["OK", event_id, accepted, message]),
            Self::Notice { message } => serde_json::json!(["NOTICE", message]),
        };
        value.to_string()
    }
}
