//! Agent identity: Ed25519 keypair generation, persistence, and hex encoding.
//!
//! An agent is named on the network by the lowercase hex of its 32-byte
//! public key. The keypair is generated once and persisted to a JSON file
//! (`{"publicKey": hex, "privateKey": hex}`) readable only by its owner.

use a2a_relay_types::error::{IdentityError, IdentityResult};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of public keys, private keys, and identities in bytes.
pub const KEY_LEN: usize = 32;

/// Length of a signature in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// A 32-byte public key. Its hex form is the agent's identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a 64-character hex identity.
    pub fn from_hex(s: &str) -> IdentityResult<Self> {
        let bytes = hex::decode(s).map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        let bytes: [u8; KEY_LEN] = bytes.as_slice().try_into().map_err(|_| {
            IdentityError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Check an Ed25519 signature over `message`. Any malformed input is a
    /// failed verification.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let Ok(key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
            return false;
        };
        key.verify(message, &Signature::from_bytes(&sig_bytes)).is_ok()
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// An agent's signing keypair. The private half is zeroized on drop.
pub struct Keypair {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl Keypair {
    /// Generate a fresh keypair from the operating system's CSPRNG.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Rebuild a keypair from its 32-byte private key.
    pub fn from_secret_bytes(secret: &[u8; KEY_LEN]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    /// Rebuild a keypair from a hex-encoded private key.
    pub fn from_secret_hex(s: &str) -> IdentityResult<Self> {
        let bytes = Zeroizing::new(
            hex::decode(s).map_err(|e| IdentityError::InvalidKey(e.to_string()))?,
        );
        let secret: Zeroizing<[u8; KEY_LEN]> =
            Zeroizing::new(bytes.as_slice().try_into().map_err(|_| {
                IdentityError::InvalidKey(format!(
                    "expected {KEY_LEN}-byte private key, got {}",
                    bytes.len()
                ))
            })?);
        Ok(Self::from_secret_bytes(&secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            public_key,
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// The agent's identity: hex of the public key.
    pub fn identity(&self) -> String {
        self.public_key.to_hex()
    }

    /// Hex of the private key, wiped from memory when dropped.
    pub fn secret_hex(&self) -> Zeroizing<String> {
        Zeroizing::new(hex::encode(self.signing_key.to_bytes()))
    }

    /// Sign `message`, returning the 64 raw signature bytes.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Load the keypair stored at `path`, or generate and persist a new one.
    ///
    /// The new file is written to a unique temporary sibling and hard-linked
    /// into place, which fails if `path` already exists. A caller that loses
    /// that race discards its own key and returns the winner's, so concurrent
    /// callers in one process always agree on the identity.
    pub fn load_or_generate(path: &Path) -> IdentityResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => return Self::from_file_contents(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let keypair = Self::generate();
        match persist_new(path, &keypair) {
            Ok(()) => {
                info!(
                    path = %path.display(),
                    identity = %keypair.identity(),
                    "Generated new agent keypair"
                );
                Ok(keypair)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Keypair created concurrently, loading it");
                let contents = std::fs::read_to_string(path)?;
                Self::from_file_contents(&contents)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse the JSON keypair file format.
    pub fn from_file_contents(contents: &str) -> IdentityResult<Self> {
        let file: KeypairFile = serde_json::from_str(contents)
            .map_err(|e| IdentityError::CorruptKeypair(e.to_string()))?;
        let keypair = Self::from_secret_hex(&file.private_key)
            .map_err(|e| IdentityError::CorruptKeypair(e.to_string()))?;
        if !keypair.identity().eq_ignore_ascii_case(&file.public_key) {
            return Err(IdentityError::CorruptKeypair(
                "public key does not match private key".to_string(),
            ));
        }
        Ok(keypair)
    }

    /// Serialize to the JSON keypair file format.
    pub fn to_file_contents(&self) -> Zeroizing<String> {
        let file = KeypairFile {
            public_key: self.identity(),
            private_key: self.secret_hex().as_str().to_owned(),
        };
        // Two string fields cannot fail to serialize.
        Zeroizing::new(serde_json::to_string_pretty(&file).unwrap_or_default())
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// On-disk keypair representation.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
struct KeypairFile {
    public_key: String,
    private_key: String,
}

/// Write `keypair` to `path` only if nothing exists there yet.
fn persist_new(path: &Path, keypair: &Keypair) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let tmp = temp_sibling(path);
    let contents = keypair.to_file_contents();
    if let Err(e) = write_owner_only(&tmp, contents.as_bytes()) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    let linked = std::fs::hard_link(&tmp, path);
    let _ = std::fs::remove_file(&tmp);
    linked
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "keypair".to_string());
    path.with_file_name(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
}

fn write_owner_only(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    let mut file = opts.open(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_generate_distinct() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        assert_ne!(a.public_key(), b.public_key());
        assert_eq!(a.identity().len(), 64);
    }

    #[test]
    fn test_hex_roundtrip() {
        let kp = Keypair::generate();
        let pk = PublicKey::from_hex(&kp.identity()).unwrap();
        assert_eq!(pk, kp.public_key());
        assert_eq!(pk.to_hex(), kp.identity());

        let restored = Keypair::from_secret_hex(&kp.secret_hex()).unwrap();
        assert_eq!(restored.public_key(), kp.public_key());
    }

    #[test]
    fn test_from_hex_rejects_garbage() {
        assert!(PublicKey::from_hex("not hex").is_err());
        assert!(PublicKey::from_hex("abcd").is_err());
        assert!(Keypair::from_secret_hex("00ff").is_err());
    }

    #[test]
    fn test_sign_verify() {
        let kp = Keypair::generate();
        let sig = kp.sign(b"hello");
        assert!(kp.public_key().verify(b"hello", &sig));
        assert!(!kp.public_key().verify(b"hellO", &sig));
        assert!(!kp.public_key().verify(b"hello", &sig[..63]));
        let other = Keypair::generate();
        assert!(!other.public_key().verify(b"hello", &sig));
    }

    #[test]
    fn test_load_or_generate_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("keypair.json");

        let first = Keypair::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.public_key(), second.public_key());

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["publicKey"], first.identity());
        assert_eq!(raw["privateKey"].as_str().unwrap().len(), 64);
    }

    #[cfg(unix)]
    #[test]
    fn test_keypair_file_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keypair.json");
        Keypair::load_or_generate(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keypair.json");
        std::fs::write(&path, "{ this is not json").unwrap();
        assert!(matches!(
            Keypair::load_or_generate(&path),
            Err(IdentityError::CorruptKeypair(_))
        ));
    }

    #[test]
    fn test_mismatched_public_key_rejected() {
        let a = Keypair::generate();
        let b = Keypair::generate();
        let contents = serde_json::json!({
            "publicKey": b.identity(),
            "privateKey": a.secret_hex().as_str(),
        })
        .to_string();
        assert!(matches!(
            Keypair::from_file_contents(&contents),
            Err(IdentityError::CorruptKeypair(_))
        ));
    }

    #[test]
    fn test_concurrent_load_or_generate_agrees() {
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("keypair.json"));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let path = Arc::clone(&path);
                std::thread::spawn(move || Keypair::load_or_generate(&path).unwrap().identity())
            })
            .collect();
        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(ids.iter().all(|id| id == &ids[0]));
        let on_disk = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(on_disk.identity(), ids[0]);

        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1, "temporary files must be cleaned up");
    }
}
