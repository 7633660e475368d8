//! # Cryptographic Primitives
//!
//! The node signs everything it says on the gossip network and refuses to
//! believe anything it cannot verify. This module is where that happens.
//!
//! - **Ed25519** for identities and signatures.
//! - **BLAKE3** for value hashes and ping/pong binding.
//!
//! Everything here is a thin, type-safe wrapper around audited crates.

pub mod hash;
pub mod keys;
pub mod signatures;

pub use hash::{blake3_hashv, hash_prefix_u64};
pub use keys::{KeyError, NodeIdentity, NodeKeypair, NodeSignature};
pub use signatures::Signable;
