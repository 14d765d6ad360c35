//! Signed wire events: the unit relays store and forward.
//!
//! An event's `id` is the hex SHA-256 of the canonical JSON array
//! `[0, pubkey, created_at, kind, tags, content]` and its `sig` signs the
//! 32 raw id bytes. A relay (or anyone else) can check both without being
//! able to read `content`.

use crate::identity::{Keypair, PublicKey};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Tag name addressing an event to a recipient identity.
pub const TAG_RECIPIENT: &str = "p";

/// Tag name referencing another event (a response's request).
pub const TAG_EVENT: &str = "e";

/// A signed event as exchanged with relays. All fields are required.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEvent {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl WireEvent {
    /// Build and sign an event stamped with the current time.
    pub fn sign(keypair: &Keypair, kind: u32, tags: Vec<Vec<String>>, content: String) -> Self {
        Self::sign_at(keypair, Utc::now().timestamp(), kind, tags, content)
    }

    /// Build and sign an event with an explicit timestamp.
    pub fn sign_at(
        keypair: &Keypair,
        created_at: i64,
        kind: u32,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Self {
        let pubkey = keypair.identity();
        let digest = event_digest(&pubkey, created_at, kind, &tags, &content);
        let sig = hex::encode(keypair.sign(&digest));
        Self {
            id: hex::encode(digest),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        }
    }

    /// Recompute the id from the other fields.
    pub fn compute_id(&self) -> String {
        hex::encode(event_digest(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        ))
    }

    /// Check that `id` matches the content and `sig` verifies under `pubkey`.
    pub fn verify(&self) -> bool {
        let digest = event_digest(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        );
        if hex::encode(digest) != self.id.to_ascii_lowercase() {
            return false;
        }
        let Ok(author) = PublicKey::from_hex(&self.pubkey) else {
            return false;
        };
        let Ok(sig) = hex::decode(&self.sig) else {
            return false;
        };
        author.verify(&digest, &sig)
    }

    /// First value of the first tag named `name`.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// Identity this event is addressed to, from its `p` tag.
    pub fn recipient(&self) -> Option<&str> {
        self.tag_value(TAG_RECIPIENT)
    }

    /// Event this one replies to, from its `e` tag.
    pub fn reply_to(&self) -> Option<&str> {
        self.tag_value(TAG_EVENT)
    }
}

/// `["p", identity]`
pub fn recipient_tag(identity: &str) -> Vec<String> {
    vec![TAG_RECIPIENT.to_string(), identity.to_string()]
}

/// `["e", event_id]`
pub fn event_tag(event_id: &str) -> Vec<String> {
    vec![TAG_EVENT.to_string(), event_id.to_string()]
}

fn event_digest(
    pubkey: &str,
    created_at: i64,
    kind: u32,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    // serde_json emits no whitespace and escapes only what JSON requires,
    // which is the canonical form relays hash.
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]).to_string();
    Sha256::digest(canonical.as_bytes()).into()
}
