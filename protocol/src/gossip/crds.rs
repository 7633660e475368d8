//! # Gossip Values
//!
//! Every record the cluster gossips travels in a [`CrdsValue`] envelope:
//! the origin's identity, a signature, a wallclock, and a tagged payload.
//! The envelope is deliberately dumb: the payload is carried as a `kind`
//! tag plus opaque bytes, so a value of a kind this node does not know still
//! decodes, still verifies, and can be skipped without poisoning the packet
//! it arrived in.
//!
//! ## Known kinds
//!
//! | kind | payload | used for |
//! |------|---------|----------|
//! | 0 | [`ContactInfo`] | addresses, shred version, software version |
//! | 1 | [`NodeInstance`] | duplicate running instance detection |
//!
//! ## Signing
//!
//! The signature covers `origin || wallclock || kind || body`. The value's
//! hash (what pull-request bloom filters are built over) covers the
//! signature too, so two differently signed copies never alias.

use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bincode::Options;
use serde::{Deserialize, Serialize};

use super::error::ProtocolError;
use super::wire::codec;
use crate::config::{MAX_CRDS_VALUE_SIZE, MAX_SERVICES};
use crate::crypto::{blake3_hashv, NodeIdentity, NodeKeypair, NodeSignature, Signable};

/// Kind tag of [`ContactInfo`] payloads.
pub const CONTACT_INFO_KIND: u16 = 0;

/// Kind tag of [`NodeInstance`] payloads.
pub const NODE_INSTANCE_KIND: u16 = 1;

// ---------------------------------------------------------------------------
// Contact Info
// ---------------------------------------------------------------------------

/// Transport a service listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Transport {
    Udp,
    Quic,
}

/// Cluster services a node can advertise besides gossip and RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Service {
    /// Block propagation (turbine) ingress.
    Tvu,
    /// Repair requests served to other nodes.
    ServeRepair,
    /// Transaction ingress.
    Tpu,
    /// Forwarded transaction ingress.
    TpuForwards,
    /// Vote ingress.
    TpuVote,
    /// Consensus message ingress.
    Alpenglow,
}

/// One advertised service endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAddr {
    pub service: Service,
    pub transport: Transport,
    pub addr: SocketAddr,
}

/// Software version a node reports about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SoftwareVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    /// First four bytes of the build commit, if known.
    pub commit: Option<u32>,
}

impl std::fmt::Display for SoftwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(commit) = self.commit {
            write!(f, " ({commit:08x})")?;
        }
        Ok(())
    }
}

/// A node's self-reported network location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactInfo {
    /// The node this record describes.
    pub identity: NodeIdentity,
    /// Self-reported time of this record, Unix milliseconds.
    pub wallclock: u64,
    /// Compatibility tag of the cluster the node believes it is in.
    pub shred_version: u16,
    /// Running software version.
    pub version: SoftwareVersion,
    /// Gossip endpoint. Pings, pulls and pushes go here.
    pub gossip: SocketAddr,
    /// JSON-RPC endpoint, if the node serves one.
    pub rpc: Option<SocketAddr>,
    /// Every other advertised endpoint.
    pub services: Vec<ServiceAddr>,
}

impl ContactInfo {
    /// A minimal record with only a gossip address.
    pub fn new(identity: NodeIdentity, gossip: SocketAddr, wallclock: u64) -> Self {
        Self {
            identity,
            wallclock,
            shred_version: 0,
            version: SoftwareVersion::default(),
            gossip,
            rpc: None,
            services: Vec::new(),
        }
    }

    /// Address of `service` over `transport`, if advertised.
    pub fn service(&self, service: Service, transport: Transport) -> Option<SocketAddr> {
        self.services
            .iter()
            .find(|s| s.service == service && s.transport == transport)
            .map(|s| s.addr)
    }

    /// Adds or replaces an advertised endpoint.
    pub fn set_service(&mut self, service: Service, transport: Transport, addr: SocketAddr) {
        self.services
            .retain(|s| !(s.service == service && s.transport == transport));
        self.services.push(ServiceAddr {
            service,
            transport,
            addr,
        });
    }

    /// Every distinct IPv4 address this node advertises, gossip first.
    pub fn all_ipv4(&self) -> Vec<Ipv4Addr> {
        let mut ips = Vec::with_capacity(2 + self.services.len());
        let addrs = std::iter::once(self.gossip)
            .chain(self.rpc)
            .chain(self.services.iter().map(|s| s.addr));
        for addr in addrs {
            if let IpAddr::V4(ip) = addr.ip() {
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
        ips
    }
}

/// Whether `addr` is something we could ever send a packet to.
pub fn is_valid_address(addr: &SocketAddr) -> bool {
    addr.port() != 0 && !addr.ip().is_unspecified() && !addr.ip().is_multicast()
}

// ---------------------------------------------------------------------------
// Node Instance
// ---------------------------------------------------------------------------

/// Announces one running process of an identity.
///
/// Two processes sharing a key would fight over the same directory slot.
/// Each process gossips a random token; seeing a different token with a
/// later start time means another process took the identity over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub identity: NodeIdentity,
    pub wallclock: u64,
    /// Process start time, Unix milliseconds.
    pub timestamp: u64,
    pub token: u64,
}

impl NodeInstance {
    /// A new instance record started at `now`.
    pub fn new(identity: NodeIdentity, token: u64, now: u64) -> Self {
        Self {
            identity,
            wallclock: now,
            timestamp: now,
            token,
        }
    }

    /// The same instance, re-stamped at `now`.
    pub fn with_wallclock(&self, now: u64) -> Self {
        Self {
            wallclock: now,
            ..self.clone()
        }
    }

    /// True if `other` is a different process with our identity that
    /// started after we did.
    pub fn is_superseded_by(&self, other: &NodeInstance) -> bool {
        self.identity == other.identity
            && self.token != other.token
            && other.timestamp > self.timestamp
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// Decoded payload of a [`CrdsValue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrdsData {
    ContactInfo(ContactInfo),
    NodeInstance(NodeInstance),
    /// A kind this build does not understand. Kept opaque.
    Unrecognized { kind: u16 },
}

impl CrdsData {
    /// Kind tag on the wire.
    pub fn kind(&self) -> u16 {
        match self {
            Self::ContactInfo(_) => CONTACT_INFO_KIND,
            Self::NodeInstance(_) => NODE_INSTANCE_KIND,
            Self::Unrecognized { kind } => *kind,
        }
    }

    fn origin_and_wallclock(&self) -> Option<(NodeIdentity, u64)> {
        match self {
            Self::ContactInfo(info) => Some((info.identity, info.wallclock)),
            Self::NodeInstance(instance) => Some((instance.identity, instance.wallclock)),
            Self::Unrecognized { .. } => None,
        }
    }

    fn encode_body(&self) -> Result<Vec<u8>, ProtocolError> {
        let body = match self {
            Self::ContactInfo(info) => {
                check_services(info)?;
                codec().serialize(info)?
            }
            Self::NodeInstance(instance) => codec().serialize(instance)?,
            Self::Unrecognized { kind } => return Err(ProtocolError::UnrecognizedKind(*kind)),
        };
        Ok(body)
    }

    fn decode_body(kind: u16, body: &[u8]) -> Result<Self, ProtocolError> {
        let data = match kind {
            CONTACT_INFO_KIND => {
                let info: ContactInfo = codec().deserialize(body)?;
                check_services(&info)?;
                Self::ContactInfo(info)
            }
            NODE_INSTANCE_KIND => Self::NodeInstance(codec().deserialize(body)?),
            other => Self::Unrecognized { kind: other },
        };
        Ok(data)
    }
}

fn check_services(info: &ContactInfo) -> Result<(), ProtocolError> {
    if info.services.len() > MAX_SERVICES {
        return Err(ProtocolError::Oversized {
            size: info.services.len(),
            limit: MAX_SERVICES,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Directory key: one slot per (origin, kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CrdsLabel {
    pub origin: NodeIdentity,
    pub kind: u16,
}

/// Exactly what goes on the wire.
#[derive(Serialize, Deserialize)]
struct WireCrdsValue {
    origin: NodeIdentity,
    signature: NodeSignature,
    wallclock: u64,
    kind: u16,
    body: Vec<u8>,
}

/// A signed, time-stamped gossip record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireCrdsValue", into = "WireCrdsValue")]
pub struct CrdsValue {
    origin: NodeIdentity,
    signature: NodeSignature,
    wallclock: u64,
    kind: u16,
    body: Vec<u8>,
    data: CrdsData,
    hash: [u8; 32],
}

impl CrdsValue {
    /// Builds and signs a value. The payload's own identity should be the
    /// keypair's, or the value will never verify anywhere.
    pub fn new_signed(data: CrdsData, keypair: &NodeKeypair) -> Result<Self, ProtocolError> {
        let (origin, wallclock) = data
            .origin_and_wallclock()
            .ok_or(ProtocolError::UnrecognizedKind(data.kind()))?;
        let body = data.encode_body()?;
        if body.len() > MAX_CRDS_VALUE_SIZE {
            return Err(ProtocolError::Oversized {
                size: body.len(),
                limit: MAX_CRDS_VALUE_SIZE,
            });
        }
        let mut value = Self {
            origin,
            signature: NodeSignature::default(),
            wallclock,
            kind: data.kind(),
            body,
            data,
            hash: [0u8; 32],
        };
        Signable::sign(&mut value, keypair);
        Ok(value)
    }

    /// The identity that signed this value.
    pub fn origin(&self) -> NodeIdentity {
        self.origin
    }

    /// Self-reported timestamp used for last-writer-wins.
    pub fn wallclock(&self) -> u64 {
        self.wallclock
    }

    /// Directory slot of this value.
    pub fn label(&self) -> CrdsLabel {
        CrdsLabel {
            origin: self.origin,
            kind: self.kind,
        }
    }

    /// Decoded payload.
    pub fn data(&self) -> &CrdsData {
        &self.data
    }

    /// The payload if this is a contact record.
    pub fn contact_info(&self) -> Option<&ContactInfo> {
        match &self.data {
            CrdsData::ContactInfo(info) => Some(info),
            _ => None,
        }
    }

    /// Hash over the signed bytes and the signature.
    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// True unless the payload kind is unknown to this build.
    pub fn is_recognized(&self) -> bool {
        !matches!(self.data, CrdsData::Unrecognized { .. })
    }

    /// Checks the signature and hands back a value the directory will take.
    pub fn into_verified(self) -> Result<VerifiedValue, ProtocolError> {
        if Signable::verify(&self) {
            Ok(VerifiedValue(self))
        } else {
            Err(ProtocolError::InvalidSignature)
        }
    }

    fn compute_hash(&self) -> [u8; 32] {
        blake3_hashv(&[self.signature.as_bytes(), &self.signable_data()])
    }
}

impl Signable for CrdsValue {
    fn pubkey(&self) -> NodeIdentity {
        self.origin
    }

    fn signable_data(&self) -> Cow<'_, [u8]> {
        let mut data = Vec::with_capacity(32 + 8 + 2 + self.body.len());
        data.extend_from_slice(self.origin.as_bytes());
        data.extend_from_slice(&self.wallclock.to_le_bytes());
        data.extend_from_slice(&self.kind.to_le_bytes());
        data.extend_from_slice(&self.body);
        Cow::Owned(data)
    }

    fn get_signature(&self) -> NodeSignature {
        self.signature
    }

    fn set_signature(&mut self, signature: NodeSignature) {
        self.signature = signature;
        self.hash = self.compute_hash();
    }
}

impl TryFrom<WireCrdsValue> for CrdsValue {
    type Error = ProtocolError;

    fn try_from(wire: WireCrdsValue) -> Result<Self, Self::Error> {
        if wire.body.len() > MAX_CRDS_VALUE_SIZE {
            return Err(ProtocolError::Oversized {
                size: wire.body.len(),
                limit: MAX_CRDS_VALUE_SIZE,
            });
        }
        let data = CrdsData::decode_body(wire.kind, &wire.body)?;
        if let Some((origin, wallclock)) = data.origin_and_wallclock() {
            if origin != wire.origin || wallclock != wire.wallclock {
                return Err(ProtocolError::InconsistentEnvelope);
            }
        }
        let mut value = Self {
            origin: wire.origin,
            signature: wire.signature,
            wallclock: wire.wallclock,
            kind: wire.kind,
            body: wire.body,
            data,
            hash: [0u8; 32],
        };
        value.hash = value.compute_hash();
        Ok(value)
    }
}

impl From<CrdsValue> for WireCrdsValue {
    fn from(value: CrdsValue) -> Self {
        Self {
            origin: value.origin,
            signature: value.signature,
            wallclock: value.wallclock,
            kind: value.kind,
            body: value.body,
        }
    }
}

/// A [`CrdsValue`] whose signature has been checked. The only thing the
/// directory accepts, so an unverified value cannot reach it by accident.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedValue(CrdsValue);

impl VerifiedValue {
    /// The checked value.
    pub fn value(&self) -> &CrdsValue {
        &self.0
    }

    /// Unwraps the checked value.
    pub fn into_inner(self) -> CrdsValue {
        self.0
    }
}
