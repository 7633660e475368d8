// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # stakescope: Core Library
//!
//! A self-hosted view of who is live in a validator cluster and how much
//! stake each of them controls. Nothing here trusts an aggregator: liveness
//! comes from signed gossip we verify ourselves, and stake comes from an RPC
//! endpoint the operator chose.
//!
//! ## Architecture
//!
//! - **crypto**: Ed25519 identities and signatures, BLAKE3 hashes.
//! - **gossip**: The anti-entropy engine and the contact directory it fills.
//! - **shred**: Which fork's nodes count as "the cluster".
//! - **stake**: Periodic stake snapshots from a trusted RPC endpoint.
//! - **ranking**: Live, compatible nodes ordered by stake.
//! - **clock**: Wallclock abstraction so tests can control time.
//! - **config**: Protocol constants and default tunables.
//!
//! ## Data flow
//!
//! ```text
//!  UDP ──> GossipService ──> GossipNode ──> ContactDirectory ─┐
//!                                                             ├──> rank()
//!  RPC ──> StakeFetcher ─────────────────> SnapshotCell ──────┘
//! ```
//!
//! The two producers never wait on each other. Ranking only reads.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod gossip;
pub mod ranking;
pub mod shred;
pub mod stake;

pub use ranking::{rank, RankedNode, RankingConfig, UnreachablePolicy};
pub use shred::{Compatibility, ShredVersionFilter, ShredVersionPolicy};
