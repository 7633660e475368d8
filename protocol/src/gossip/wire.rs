//! # Wire Protocol
//!
//! The six gossip message kinds, their binary codec, and the signature and
//! shape checks a packet passes before the engine looks at it.
//!
//! ## Encoding
//!
//! `bincode` with fixed-width little-endian integers and a hard size limit
//! of [`PACKET_DATA_SIZE`]. A packet that is oversized, truncated, carries
//! trailing garbage or fails to deserialize is a [`ProtocolError`] and is
//! dropped whole.
//!
//! ## Verification order
//!
//! Decoding never trusts content. [`Protocol::sanitize`] rejects impossible
//! shapes, then [`Protocol::verify_signatures`] drops every value, ping,
//! pong or prune whose signature does not check out against the identity it
//! names. Only what survives both reaches the engine.

use std::borrow::Cow;

use bincode::Options;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::bloom::CrdsFilter;
use super::crds::CrdsValue;
use super::error::ProtocolError;
use crate::config::{MAX_PRUNE_ORIGINS, PACKET_DATA_SIZE, PING_PONG_HASH_PREFIX};
use crate::crypto::{blake3_hashv, NodeIdentity, NodeKeypair, NodeSignature, Signable};

/// Domain separator for prune signatures.
const PRUNE_DATA_PREFIX: &[u8] = b"\xffSTAKESCOPE_PRUNE_DATA";

/// Bytes taken by a message's variant tag and sender identity, plus the
/// length prefix of its value list.
const MESSAGE_HEADER_SIZE: usize = 4 + 32 + 8;

/// The codec every gossip byte goes through.
pub(crate) fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(PACKET_DATA_SIZE as u64)
}

// ---------------------------------------------------------------------------
// Ping / Pong
// ---------------------------------------------------------------------------

/// A liveness challenge: "sign the hash of this token if you are who you
/// claim to be, at the address you claim".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    from: NodeIdentity,
    token: [u8; 32],
    signature: NodeSignature,
}

impl Ping {
    /// A signed ping carrying `token`.
    pub fn new(token: [u8; 32], keypair: &NodeKeypair) -> Self {
        let mut ping = Self {
            from: keypair.identity(),
            token,
            signature: NodeSignature::default(),
        };
        ping.sign(keypair);
        ping
    }

    /// A signed ping with a fresh random token.
    pub fn random<R: Rng + ?Sized>(rng: &mut R, keypair: &NodeKeypair) -> Self {
        Self::new(rng.gen(), keypair)
    }

    pub fn from(&self) -> NodeIdentity {
        self.from
    }

    pub fn token(&self) -> &[u8; 32] {
        &self.token
    }
}

impl Signable for Ping {
    fn pubkey(&self) -> NodeIdentity {
        self.from
    }

    fn signable_data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.token)
    }

    fn get_signature(&self) -> NodeSignature {
        self.signature
    }

    fn set_signature(&mut self, signature: NodeSignature) {
        self.signature = signature;
    }
}

/// The answer to a [`Ping`]: the responder's signature over the hashed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    from: NodeIdentity,
    hash: [u8; 32],
    signature: NodeSignature,
}

impl Pong {
    /// Answers `ping` as `keypair`.
    pub fn new(ping: &Ping, keypair: &NodeKeypair) -> Self {
        let mut pong = Self {
            from: keypair.identity(),
            hash: pong_hash(&ping.token),
            signature: NodeSignature::default(),
        };
        pong.sign(keypair);
        pong
    }

    pub fn from(&self) -> NodeIdentity {
        self.from
    }

    /// Hash of the token this pong answers.
    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }
}

impl Signable for Pong {
    fn pubkey(&self) -> NodeIdentity {
        self.from
    }

    fn signable_data(&self) -> Cow<'_, [u8]> {
        Cow::Borrowed(&self.hash)
    }

    fn get_signature(&self) -> NodeSignature {
        self.signature
    }

    fn set_signature(&mut self, signature: NodeSignature) {
        self.signature = signature;
    }
}

/// The hash a pong must carry for a ping with `token`.
pub fn pong_hash(token: &[u8; 32]) -> [u8; 32] {
    blake3_hashv(&[PING_PONG_HASH_PREFIX, token])
}

// ---------------------------------------------------------------------------
// Prune
// ---------------------------------------------------------------------------

/// "Stop pushing me values from these origins": sent by `pubkey` to
/// `destination` when too many peers deliver the same origins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneData {
    pub pubkey: NodeIdentity,
    pub prunes: Vec<NodeIdentity>,
    pub signature: NodeSignature,
    pub destination: NodeIdentity,
    pub wallclock: u64,
}

impl PruneData {
    /// A signed prune from `keypair` to `destination`.
    pub fn new(
        keypair: &NodeKeypair,
        prunes: Vec<NodeIdentity>,
        destination: NodeIdentity,
        wallclock: u64,
    ) -> Self {
        let mut data = Self {
            pubkey: keypair.identity(),
            prunes,
            signature: NodeSignature::default(),
            destination,
            wallclock,
        };
        data.sign(keypair);
        data
    }
}

impl Signable for PruneData {
    fn pubkey(&self) -> NodeIdentity {
        self.pubkey
    }

    fn signable_data(&self) -> Cow<'_, [u8]> {
        let mut data =
            Vec::with_capacity(PRUNE_DATA_PREFIX.len() + 32 * (self.prunes.len() + 2) + 8);
        data.extend_from_slice(PRUNE_DATA_PREFIX);
        data.extend_from_slice(self.pubkey.as_bytes());
        for origin in &self.prunes {
            data.extend_from_slice(origin.as_bytes());
        }
        data.extend_from_slice(self.destination.as_bytes());
        data.extend_from_slice(&self.wallclock.to_le_bytes());
        Cow::Owned(data)
    }

    fn get_signature(&self) -> NodeSignature {
        self.signature
    }

    fn set_signature(&mut self, signature: NodeSignature) {
        self.signature = signature;
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

/// Every message that travels between gossip peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// "Here is a digest of what I have; send me what I lack." Carries the
    /// caller's own contact record so the responder can learn about it.
    PullRequest(CrdsFilter, CrdsValue),
    /// Values the caller was missing.
    PullResponse(NodeIdentity, Vec<CrdsValue>),
    /// Fresh values pushed proactively.
    PushMessage(NodeIdentity, Vec<CrdsValue>),
    /// Redundant-path suppression.
    PruneMessage(NodeIdentity, PruneData),
    PingMessage(Ping),
    PongMessage(Pong),
}

impl Protocol {
    /// Short name for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PullRequest(..) => "pull_request",
            Self::PullResponse(..) => "pull_response",
            Self::PushMessage(..) => "push",
            Self::PruneMessage(..) => "prune",
            Self::PingMessage(_) => "ping",
            Self::PongMessage(_) => "pong",
        }
    }

    /// Rejects messages whose shape is impossible regardless of signatures.
    pub fn sanitize(&self) -> Result<(), ProtocolError> {
        match self {
            Self::PullRequest(filter, caller) => {
                if !filter.is_well_formed() {
                    return Err(ProtocolError::InconsistentEnvelope);
                }
                if caller.contact_info().is_none() {
                    return Err(ProtocolError::InconsistentEnvelope);
                }
                Ok(())
            }
            Self::PullResponse(_, values) | Self::PushMessage(_, values) => {
                if values.is_empty() {
                    Err(ProtocolError::Empty)
                } else {
                    Ok(())
                }
            }
            Self::PruneMessage(from, data) => {
                if *from != data.pubkey {
                    return Err(ProtocolError::InconsistentEnvelope);
                }
                if data.prunes.is_empty() {
                    return Err(ProtocolError::Empty);
                }
                if data.prunes.len() > MAX_PRUNE_ORIGINS {
                    return Err(ProtocolError::Oversized {
                        size: data.prunes.len(),
                        limit: MAX_PRUNE_ORIGINS,
                    });
                }
                Ok(())
            }
            Self::PingMessage(_) | Self::PongMessage(_) => Ok(()),
        }
    }

    /// Drops everything whose signature fails.
    ///
    /// Value lists are filtered value by value, so one forged value does not
    /// cost the honest ones travelling with it. Returns `None` when nothing
    /// verifiable is left.
    pub fn verify_signatures(self) -> Option<Self> {
        match self {
            Self::PullRequest(filter, caller) => {
                Signable::verify(&caller).then_some(Self::PullRequest(filter, caller))
            }
            Self::PullResponse(from, values) => {
                let values = retain_verified(values)?;
                Some(Self::PullResponse(from, values))
            }
            Self::PushMessage(from, values) => {
                let values = retain_verified(values)?;
                Some(Self::PushMessage(from, values))
            }
            Self::PruneMessage(from, data) => data
                .verify()
                .then_some(Self::PruneMessage(from, data)),
            Self::PingMessage(ping) => ping.verify().then_some(Self::PingMessage(ping)),
            Self::PongMessage(pong) => pong.verify().then_some(Self::PongMessage(pong)),
        }
    }
}

fn retain_verified(mut values: Vec<CrdsValue>) -> Option<Vec<CrdsValue>> {
    let before = values.len();
    values.retain(|value| Signable::verify(value));
    if values.len() < before {
        trace!(dropped = before - values.len(), "dropped values with bad signatures");
    }
    (!values.is_empty()).then_some(values)
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Serializes a message, refusing anything that does not fit one packet.
pub fn encode(message: &Protocol) -> Result<Vec<u8>, ProtocolError> {
    let size = serialized_size(message);
    if size > PACKET_DATA_SIZE {
        return Err(ProtocolError::Oversized {
            size,
            limit: PACKET_DATA_SIZE,
        });
    }
    Ok(codec().serialize(message)?)
}

/// Parses one packet.
pub fn decode(bytes: &[u8]) -> Result<Protocol, ProtocolError> {
    if bytes.len() > PACKET_DATA_SIZE {
        return Err(ProtocolError::Oversized {
            size: bytes.len(),
            limit: PACKET_DATA_SIZE,
        });
    }
    Ok(codec().deserialize(bytes)?)
}

/// Bytes `value` takes on the wire, or `usize::MAX` if it cannot be encoded
/// within the packet limit.
pub fn serialized_size<T: Serialize + ?Sized>(value: &T) -> usize {
    codec()
        .serialized_size(value)
        .map(|size| size as usize)
        .unwrap_or(usize::MAX)
}

/// Packs `values` greedily into as few packets as possible, wrapping each
/// batch with `wrap`. Values too large for any packet are skipped.
pub fn split_into_messages<F>(values: Vec<CrdsValue>, wrap: F) -> Vec<Protocol>
where
    F: Fn(Vec<CrdsValue>) -> Protocol,
{
    let budget = PACKET_DATA_SIZE - MESSAGE_HEADER_SIZE;
    let mut messages = Vec::new();
    let mut batch = Vec::new();
    let mut batch_size = 0usize;

    for value in values {
        let size = serialized_size(&value);
        if size > budget {
            trace!(origin = %value.origin(), size, "value does not fit a packet");
            continue;
        }
        if batch_size + size > budget {
            messages.push(wrap(std::mem::take(&mut batch)));
            batch_size = 0;
        }
        batch_size += size;
        batch.push(value);
    }
    if !batch.is_empty() {
        messages.push(wrap(batch));
    }
    messages
}
