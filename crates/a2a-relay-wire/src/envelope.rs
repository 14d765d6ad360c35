//! Envelope codec: authenticated encryption between two agent identities.
//!
//! The scheme:
//! 1. Derive a symmetric key as SHA-256 over both public keys (sorted, so
//!    either side computes the same key) followed by a domain constant.
//! 2. Encrypt with AES-256-GCM under a fresh random 96-bit nonce.
//! 3. Sign `ciphertext || nonce` with the sender's Ed25519 key.
//!
//! Opening an envelope verifies the signature before any decryption is
//! attempted.
//!
//! The key depends only on the two long-term identities, so there is no
//! forward secrecy: whoever later learns either private key can decrypt
//! recorded traffic between the pair.

use crate::identity::{Keypair, PublicKey, SIGNATURE_LEN};
use a2a_relay_types::error::EnvelopeError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// Domain separation constant appended to the key derivation input.
pub const KEY_DERIVATION_DOMAIN: &[u8] = b"a2a-relay/envelope/v1";

/// AES-GCM nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// An encrypted, signed payload from one identity to another.
///
/// The recipient is not recorded; it is implied by whoever can open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// AES-256-GCM output: ciphertext followed by the 16-byte tag.
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: [u8; NONCE_LEN],
    pub sender_pub_key: PublicKey,
    /// Ed25519 signature over `ciphertext || nonce`.
    #[serde(with = "hex_bytes")]
    pub signature: [u8; SIGNATURE_LEN],
}

impl Envelope {
    /// Encrypt `plaintext` from `sender` to `recipient`.
    pub fn seal(
        plaintext: &[u8],
        sender: &Keypair,
        recipient: &PublicKey,
    ) -> Result<Self, EnvelopeError> {
        let key = derive_key(&sender.public_key(), recipient);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| EnvelopeError::EncryptionFailed)?;
        let signature = sender.sign(&signed_bytes(&ciphertext, &nonce));

        Ok(Self {
            ciphertext,
            nonce,
            sender_pub_key: sender.public_key(),
            signature,
        })
    }

    /// Verify and decrypt an envelope addressed to `recipient`.
    pub fn open(&self, recipient: &Keypair) -> Result<Vec<u8>, EnvelopeError> {
        if !self.verify() {
            return Err(EnvelopeError::InvalidSignature);
        }

        let key = derive_key(&self.sender_pub_key, &recipient.public_key());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_slice()));
        cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.ciphertext.as_slice())
            .map_err(|_| EnvelopeError::DecryptionFailed)
    }

    /// Check the sender's signature without decrypting.
    pub fn verify(&self) -> bool {
        self.sender_pub_key
            .verify(&signed_bytes(&self.ciphertext, &self.nonce), &self.signature)
    }

    pub fn to_json(&self) -> String {
        // Every field serializes to a plain string.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(json: &str) -> Result<Self, EnvelopeError> {
        serde_json::from_str(json).map_err(|e| EnvelopeError::Malformed(e.to_string()))
    }
}

/// Encrypt `plaintext` for `recipient`.
pub fn encrypt(
    plaintext: &[u8],
    sender: &Keypair,
    recipient: &PublicKey,
) -> Result<Envelope, EnvelopeError> {
    Envelope::seal(plaintext, sender, recipient)
}

/// Verify and decrypt `envelope` with the recipient's keypair.
pub fn decrypt(envelope: &Envelope, recipient: &Keypair) -> Result<Vec<u8>, EnvelopeError> {
    envelope.open(recipient)
}

/// Derive the shared symmetric key for a pair of identities.
///
/// Order-independent: `derive_key(a, b) == derive_key(b, a)`.
pub fn derive_key(a: &PublicKey, b: &PublicKey) -> Zeroizing<[u8; 32]> {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(lo.as_bytes());
    hasher.update(hi.as_bytes());
    hasher.update(KEY_DERIVATION_DOMAIN);
    Zeroizing::new(hasher.finalize().into())
}

fn signed_bytes(ciphertext: &[u8], nonce: &[u8; NONCE_LEN]) -> Vec<u8> {
    let mut data = Vec::with_capacity(ciphertext.len() + NONCE_LEN);
    data.extend_from_slice(ciphertext);
    data.extend_from_slice(nonce);
    data
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T: AsRef<[u8]>>(bytes: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let s = String::deserialize(d)?;
        let bytes = STANDARD.decode(s).map_err(serde::de::Error::custom)?;
        let len = bytes.len();
        T::try_from(bytes)
            .map_err(|_| serde::de::Error::custom(format!("unexpected length {len}")))
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, T: AsRef<[u8]>>(bytes: &T, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D, T>(d: D) -> Result<T, D::Error>
    where
        D: Deserializer<'de>,
        T: TryFrom<Vec<u8>>,
    {
        let s = String::deserialize(d)?;
        let bytes = hex::decode(s).map_err(serde::de::Error::custom)?;
        let len = bytes.len();
        T::try_from(bytes)
            .map_err(|_| serde::de::Error::custom(format!("unexpected length {len}")))
    }
}
