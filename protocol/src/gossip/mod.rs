//! # Gossip Module
//!
//! A spy participant in a cluster's gossip protocol. We advertise a contact
//! record so peers will talk to us, but we exist to listen: the product of
//! this module is the [`ContactDirectory`], a converged view of every node
//! the cluster knows about.
//!
//! ## Architecture
//!
//! ```text
//! crds.rs      : Signed gossip values: contact records, instance records
//! wire.rs      : Protocol messages and their bincode encoding
//! bloom.rs     : Bloom filters partitioned into pull request digests
//! directory.rs : Last-writer-wins table of verified values
//! ping.rs      : Ping/pong liveness checks of advertised addresses
//! push.rs      : Push fan-out, ingress scoring and prunes
//! pull.rs      : Pull peer selection and pull request serving
//! node.rs      : The engine as a message-driven state machine
//! service.rs   : Async UDP driver and round timers
//! error.rs     : Protocol, network and startup error types
//! ```
//!
//! ## Design Decisions
//!
//! - The engine is synchronous and returns the datagrams to send. The
//!   service is the only place that touches a socket or a timer, so
//!   convergence can be tested with many nodes in one thread.
//! - Signatures are verified once, at the edge. The directory only accepts
//!   a [`crds::VerifiedValue`], so an unverified value cannot be stored.
//! - The directory is a `DashMap` keyed by label. The entry API makes each
//!   compare-and-replace atomic per key without a global lock.

pub mod bloom;
pub mod crds;
pub mod directory;
pub mod error;
pub mod node;
pub mod ping;
pub mod pull;
pub mod push;
pub mod service;
pub mod wire;

pub use crds::{
    ContactInfo, CrdsData, CrdsLabel, CrdsValue, NodeInstance, Service, ServiceAddr,
    SoftwareVersion, Transport, VerifiedValue,
};
pub use directory::{ContactDirectory, LiveContact, UpsertError, UpsertOutcome};
pub use error::{NetworkError, ProtocolError, StartupError};
pub use node::{GossipConfig, GossipNode, GossipStats, GossipStatsSnapshot, Outbound};
pub use service::{bind_socket, GossipService};
pub use wire::Protocol;
