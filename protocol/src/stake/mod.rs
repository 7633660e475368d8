//! # Stake
//!
//! Stake distribution retrieval. A [`StakeFetcher`] polls a trusted
//! [`StakeSource`] and publishes immutable [`StakeSnapshot`]s through a
//! [`SnapshotCell`]; ranking reads whichever snapshot is current.

pub mod fetcher;
pub mod rpc;
pub mod snapshot;

pub use fetcher::{FetchStatus, StakeFetcher, StakeFetcherConfig};
pub use rpc::{FetchError, RpcConfig, RpcStakeSource, StakeDistribution, StakeSource};
pub use snapshot::{SnapshotCell, StakeSnapshot};
