//! Immutable stake snapshots and the cell that publishes them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::crypto::NodeIdentity;

/// Stake per node identity, as of one successful fetch. Never mutated after
/// construction: a newer fetch produces a new snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StakeSnapshot {
    pub epoch: u64,
    /// When the fetch completed, Unix milliseconds. Zero for the empty
    /// placeholder used before any fetch succeeded.
    pub fetched_at: u64,
    stakes: HashMap<NodeIdentity, u64>,
}

impl StakeSnapshot {
    pub fn new(epoch: u64, fetched_at: u64, stakes: HashMap<NodeIdentity, u64>) -> Self {
        Self {
            epoch,
            fetched_at,
            stakes,
        }
    }

    /// Stake of `identity`, zero when absent.
    pub fn stake_of(&self, identity: &NodeIdentity) -> u64 {
        self.stakes.get(identity).copied().unwrap_or_default()
    }

    pub fn contains(&self, identity: &NodeIdentity) -> bool {
        self.stakes.contains_key(identity)
    }

    pub fn total_stake(&self) -> u64 {
        self.stakes.values().fold(0u64, |acc, s| acc.saturating_add(*s))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeIdentity, &u64)> {
        self.stakes.iter()
    }

    pub fn len(&self) -> usize {
        self.stakes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stakes.is_empty()
    }
}

/// The current snapshot, swapped wholesale.
///
/// Readers clone the `Arc` under a read lock and then work lock-free, so a
/// reader always sees one snapshot in full and never blocks a fetch for
/// longer than a pointer copy.
#[derive(Debug, Default)]
pub struct SnapshotCell {
    current: RwLock<Option<Arc<StakeSnapshot>>>,
}

impl SnapshotCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// The latest successful snapshot, or an empty one if none yet.
    pub fn current(&self) -> Arc<StakeSnapshot> {
        self.current.read().clone().unwrap_or_default()
    }

    /// The latest successful snapshot, if any.
    pub fn latest(&self) -> Option<Arc<StakeSnapshot>> {
        self.current.read().clone()
    }

    /// Publishes `snapshot`, superseding the previous one.
    pub fn replace(&self, snapshot: StakeSnapshot) -> Option<Arc<StakeSnapshot>> {
        self.current.write().replace(Arc::new(snapshot))
    }
}
