//! # Key Management
//!
//! Ed25519 keypairs and the two public artefacts they produce: the
//! [`NodeIdentity`] every gossip record is keyed by, and the
//! [`NodeSignature`] every record carries.
//!
//! ## Textual encoding
//!
//! Identities are displayed and parsed as base58, which is how the stake RPC
//! collaborator spells them in its responses. Secret keys on disk are hex,
//! because that is what `stakescope-node keygen` writes.
//!
//! ## Security considerations
//!
//! - Private keys are zeroized on drop (thanks, ed25519-dalek).
//! - Key generation uses `OsRng`.
//! - Key bytes are never logged, and `Debug` only prints the public half.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use ed25519_dalek::{
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::config::{IDENTITY_LENGTH, SIGNATURE_LENGTH};

/// Errors that can occur during key operations.
///
/// Vague about *why* on purpose: key material does not belong in error text.
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("invalid secret key bytes: wrong length or not hex")]
    InvalidSecretKey,

    #[error("invalid public key: not a 32-byte base58 string")]
    InvalidPublicKey,

    #[error("cannot read key file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// NodeKeypair
// ---------------------------------------------------------------------------

/// The local node's signing keypair.
///
/// Signs every outgoing gossip record, ping, pong and prune. Intentionally
/// does not implement `Serialize`: exporting a secret should be explicit.
pub struct NodeKeypair {
    signing_key: SigningKey,
}

impl NodeKeypair {
    /// Generates a fresh keypair from the OS RNG.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Builds a keypair deterministically from a 32-byte seed.
    ///
    /// Tests use this to get stable identities (and therefore stable
    /// ranking tie-breaks).
    pub fn from_seed(seed: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(seed),
        }
    }

    /// Parses a hex-encoded 32-byte secret key.
    pub fn from_hex(hex_str: &str) -> Result<Self, KeyError> {
        let bytes = hex::decode(hex_str.trim()).map_err(|_| KeyError::InvalidSecretKey)?;
        let seed: [u8; SECRET_KEY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidSecretKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Loads a keypair from a file containing a hex-encoded secret key.
    pub fn read_from_file(path: &Path) -> Result<Self, KeyError> {
        let contents = std::fs::read_to_string(path).map_err(|source| KeyError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_hex(&contents)
    }

    /// Hex encoding of the secret key, the format `read_from_file` expects.
    ///
    /// **Handle with care.** Whoever holds this string can impersonate the node.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// The public identity derived from this keypair.
    pub fn identity(&self) -> NodeIdentity {
        NodeIdentity(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs `message`. Deterministic per RFC 8032.
    pub fn sign(&self, message: &[u8]) -> NodeSignature {
        NodeSignature(self.signing_key.sign(message).to_bytes())
    }
}

impl Clone for NodeKeypair {
    fn clone(&self) -> Self {
        Self::from_seed(&self.signing_key.to_bytes())
    }
}

impl fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeKeypair(pub={})", self.identity())
    }
}

// ---------------------------------------------------------------------------
// NodeIdentity
// ---------------------------------------------------------------------------

/// A node's Ed25519 public key. Immutable, unique per node, and the key of
/// every directory entry.
///
/// Ordering is bytewise, which is what the ranking tie-break relies on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeIdentity([u8; IDENTITY_LENGTH]);

impl NodeIdentity {
    /// Wraps raw bytes. No curve-point check: use [`Self::verify`] to find
    /// out whether the bytes are a usable key.
    pub const fn new(bytes: [u8; IDENTITY_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; IDENTITY_LENGTH] {
        &self.0
    }

    /// Verifies `signature` over `message` against this identity.
    ///
    /// Returns `false` for malformed keys as well as bad signatures. Callers
    /// only ever need a yes/no.
    pub fn verify(&self, message: &[u8], signature: &NodeSignature) -> bool {
        let Ok(verifying_key) = VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let signature = DalekSignature::from_bytes(&signature.0);
        verifying_key.verify(message, &signature).is_ok()
    }

    /// Base58 text form.
    pub fn to_base58(&self) -> String {
        bs58::encode(self.0).into_string()
    }
}

impl FromStr for NodeIdentity {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        let bytes: [u8; IDENTITY_LENGTH] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidPublicKey)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = self.to_base58();
        write!(f, "NodeIdentity({})", &text[..text.len().min(8)])
    }
}

// ---------------------------------------------------------------------------
// NodeSignature
// ---------------------------------------------------------------------------

/// A 64-byte Ed25519 signature, fixed-size on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSignature(#[serde(with = "BigArray")] [u8; SIGNATURE_LENGTH]);

impl NodeSignature {
    /// Wraps raw bytes.
    pub const fn new(bytes: [u8; SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.0
    }
}

impl Default for NodeSignature {
    fn default() -> Self {
        Self([0u8; SIGNATURE_LENGTH])
    }
}

impl fmt::Debug for NodeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex_str = hex::encode(self.0);
        write!(f, "NodeSignature({}...{})", &hex_str[..8], &hex_str[120..])
    }
}
