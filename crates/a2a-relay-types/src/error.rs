//! Error types for the a2a-relay transport.
//!
//! Each layer has its own enum so callers can match on exactly the failures
//! that layer can produce. Remote-originated garbage never surfaces through
//! these types to the application handler; it is logged and dropped.

use std::time::Duration;
use thiserror::Error;

/// Errors from loading, generating, or parsing a keypair.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// The keypair file exists but its contents are not a valid keypair.
    #[error("Corrupt keypair file: {0}")]
    CorruptKeypair(String),

    /// A key string or byte slice is not a valid public or private key.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Reading or persisting the keypair file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from sealing or opening an envelope.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    /// The signature over `ciphertext || nonce` did not verify.
    #[error("Envelope signature verification failed")]
    InvalidSignature,

    /// The AEAD tag did not verify, or the ciphertext length is malformed.
    #[error("Envelope decryption failed")]
    DecryptionFailed,

    /// The AEAD cipher refused to encrypt the plaintext.
    #[error("Envelope encryption failed")]
    EncryptionFailed,

    /// An encoded field (base64, hex, key or nonce length) is malformed.
    #[error("Malformed envelope: {0}")]
    Malformed(String),
}

/// Errors from a single relay link.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The link is not currently connected; nothing was sent.
    #[error("Relay {0} is not connected")]
    NotConnected(String),

    /// No acknowledgement arrived within the publish timeout.
    #[error("Relay did not acknowledge event within {0:?}")]
    Timeout(Duration),

    /// The relay acknowledged the event with `success = false`.
    #[error("Relay rejected event: {0}")]
    Rejected(String),

    /// The connection dropped while the publish was in flight.
    #[error("Connection to relay lost")]
    ConnectionLost,

    /// Establishing the WebSocket connection failed.
    #[error("Failed to connect to relay: {0}")]
    Connect(String),

    /// The relay URL is not a `ws://` or `wss://` URL.
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    /// The link has been shut down.
    #[error("Relay link closed")]
    Closed,
}

/// Errors surfaced to callers of the transport orchestrator.
#[derive(Error, Debug)]
pub enum TransportError {
    /// `connect()` could not reach any of the configured relays.
    #[error("No relays available: could not connect to any of {0} relay(s)")]
    NoRelaysAvailable(usize),

    /// `send()` was called while zero relay links are connected.
    #[error("No connected relays")]
    NoConnectedRelays,

    /// No correlated response arrived before the deadline.
    #[error("Request timed out after {0:?}")]
    TimedOut(Duration),

    /// The transport was disconnected while the request was outstanding.
    #[error("Transport closed")]
    TransportClosed,

    /// The recipient identity is not a valid public key, or is our own.
    #[error("Invalid recipient identity: {0}")]
    InvalidRecipient(String),

    /// Every relay rejected or failed to acknowledge the request.
    #[error("Publish failed on every relay: {0}")]
    PublishFailed(String),

    /// Sealing the outbound envelope failed.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    /// Identity loading failed.
    #[error(transparent)]
    Identity(#[from] IdentityError),

    /// A payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias for identity results.
pub type IdentityResult<T> = Result<T, IdentityError>;

/// Alias for relay link results.
pub type RelayResult<T> = Result<T, RelayError>;

/// Alias for transport results.
pub type TransportResult<T> = Result<T, TransportError>;
