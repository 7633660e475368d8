//! # Contact Directory
//!
//! The local table of every signed gossip value we currently believe, one
//! slot per (origin, kind). Everything the gossip engine learns lands here,
//! and everything the ranking merger reads comes from here.
//!
//! ## Update rule
//!
//! Last writer wins on the self-reported wallclock: a value replaces the
//! stored one for its slot only if its wallclock is strictly greater. Equal
//! or older wallclocks are no-ops, so replaying any set of updates in any
//! order converges to the same table.
//!
//! ## Concurrency
//!
//! Backed by a `DashMap`. An upsert holds the write lock of one shard for the
//! compare-and-replace, so concurrent writers to the same slot cannot lose
//! updates, and readers only ever see a whole entry, old or new.
//!
//! Only verified values get in: [`ContactDirectory::insert`] takes a
//! [`VerifiedValue`], and [`ContactDirectory::upsert`] verifies first.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

use super::crds::{
    ContactInfo, CrdsData, CrdsLabel, CrdsValue, NodeInstance, VerifiedValue, CONTACT_INFO_KIND,
    NODE_INSTANCE_KIND,
};
use crate::config::{ENTRY_TIMEOUT, PING_TTL};
use crate::crypto::NodeIdentity;

/// Why an upsert did not change the table.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UpsertError {
    #[error("value signature does not verify against its origin")]
    InvalidSignature,

    #[error("stored wallclock {stored} is not older than incoming {incoming}")]
    Stale { stored: u64, incoming: u64 },

    #[error("value kind {0} is not stored")]
    Unrecognized(u16),
}

/// What an accepted upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First value seen for the slot.
    Inserted,
    /// Replaced an older value.
    Updated { previous_wallclock: u64 },
}

/// One stored value plus local bookkeeping.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub value: CrdsValue,
    /// Local time the value was accepted. Eviction runs on this, not on the
    /// origin's wallclock, so a skewed peer clock cannot keep itself alive.
    pub local_timestamp: u64,
    /// Insertion sequence number, used by push to find new values.
    pub ordinal: u64,
    /// Local time the origin last answered a ping at this record's gossip
    /// address. `None` until then.
    pub verified_at: Option<u64>,
}

impl DirectoryEntry {
    fn is_verified(&self, ttl: u64, now: u64) -> bool {
        self.verified_at
            .is_some_and(|at| now.saturating_sub(at) < ttl)
    }
}

/// A live contact record as handed to readers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveContact {
    pub info: ContactInfo,
    /// Local time of the last accepted update.
    pub last_updated: u64,
    /// Whether the node answered a ping at its advertised gossip address.
    pub verified: bool,
}

/// Concurrency-safe table of the best-known value per slot.
#[derive(Debug)]
pub struct ContactDirectory {
    entries: DashMap<CrdsLabel, DirectoryEntry>,
    next_ordinal: AtomicU64,
    entry_timeout: Duration,
    verification_ttl: Duration,
}

impl Default for ContactDirectory {
    fn default() -> Self {
        Self::new(ENTRY_TIMEOUT)
    }
}

impl ContactDirectory {
    /// An empty directory evicting entries after `entry_timeout` without
    /// an update.
    pub fn new(entry_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            next_ordinal: AtomicU64::new(1),
            entry_timeout,
            verification_ttl: PING_TTL,
        }
    }

    /// Sets how long a pong keeps an entry verified.
    pub fn with_verification_ttl(mut self, ttl: Duration) -> Self {
        self.verification_ttl = ttl;
        self
    }

    /// Verifies `value` and stores it if it is newer than what we hold.
    pub fn upsert(&self, value: CrdsValue, now: u64) -> Result<UpsertOutcome, UpsertError> {
        let verified = value
            .into_verified()
            .map_err(|_| UpsertError::InvalidSignature)?;
        self.insert(verified, now)
    }

    /// Stores an already verified value if it is newer than what we hold.
    pub fn insert(&self, value: VerifiedValue, now: u64) -> Result<UpsertOutcome, UpsertError> {
        let value = value.into_inner();
        if !value.is_recognized() {
            return Err(UpsertError::Unrecognized(value.label().kind));
        }
        let label = value.label();
        let incoming = value.wallclock();

        match self.entries.entry(label) {
            Entry::Vacant(slot) => {
                trace!(origin = %label.origin, kind = label.kind, "new directory entry");
                slot.insert(DirectoryEntry {
                    value,
                    local_timestamp: now,
                    ordinal: self.next_ordinal.fetch_add(1, Ordering::Relaxed),
                    verified_at: None,
                });
                Ok(UpsertOutcome::Inserted)
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get().value.wallclock();
                if incoming <= stored {
                    return Err(UpsertError::Stale { stored, incoming });
                }
                // Liveness proof is tied to an address; a move must re-earn it.
                let verified_at = match (slot.get().value.contact_info(), value.contact_info()) {
                    (Some(old), Some(new)) if old.gossip == new.gossip => slot.get().verified_at,
                    (None, None) => slot.get().verified_at,
                    _ => None,
                };
                slot.insert(DirectoryEntry {
                    value,
                    local_timestamp: now,
                    ordinal: self.next_ordinal.fetch_add(1, Ordering::Relaxed),
                    verified_at,
                });
                Ok(UpsertOutcome::Updated {
                    previous_wallclock: stored,
                })
            }
        }
    }

    /// Contact records updated within `max_age` of `now`.
    ///
    /// Lazy and finite. Each call starts a fresh pass over the table; values
    /// written during a pass may or may not be observed by it.
    pub fn live_entries(
        &self,
        max_age: Duration,
        now: u64,
    ) -> impl Iterator<Item = LiveContact> + '_ {
        let max_age = max_age.as_millis() as u64;
        let ttl = self.verification_ttl.as_millis() as u64;
        self.entries.iter().filter_map(move |entry| {
            if now.saturating_sub(entry.local_timestamp) > max_age {
                return None;
            }
            let info = entry.value.contact_info()?;
            Some(LiveContact {
                info: info.clone(),
                last_updated: entry.local_timestamp,
                verified: entry.is_verified(ttl, now),
            })
        })
    }

    /// Drops entries whose last update is older than the entry timeout.
    /// Returns the number removed.
    pub fn evict_stale(&self, now: u64) -> usize {
        let timeout = self.entry_timeout.as_millis() as u64;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.local_timestamp) <= timeout);
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "evicted stale entries");
        }
        evicted
    }

    /// Marks `identity` as having answered a ping at `addr`. Ignored unless
    /// `addr` is the gossip address of its current contact record.
    pub fn promote(&self, identity: &NodeIdentity, addr: SocketAddr, now: u64) -> bool {
        let label = CrdsLabel {
            origin: *identity,
            kind: CONTACT_INFO_KIND,
        };
        match self.entries.get_mut(&label) {
            Some(mut entry) if entry.value.contact_info().is_some_and(|c| c.gossip == addr) => {
                entry.verified_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Whether `identity` answered a ping at its current gossip address
    /// within the verification TTL.
    pub fn is_verified(&self, identity: &NodeIdentity, now: u64) -> bool {
        let ttl = self.verification_ttl.as_millis() as u64;
        self.entries
            .get(&contact_label(identity))
            .is_some_and(|entry| entry.is_verified(ttl, now))
    }

    /// The stored value in `label`'s slot.
    pub fn get(&self, label: &CrdsLabel) -> Option<CrdsValue> {
        self.entries.get(label).map(|entry| entry.value.clone())
    }

    /// The stored contact record of `identity`.
    pub fn get_contact(&self, identity: &NodeIdentity) -> Option<ContactInfo> {
        let entry = self.entries.get(&contact_label(identity))?;
        entry.value.contact_info().cloned()
    }

    /// The stored instance record of `identity`.
    pub fn get_instance(&self, identity: &NodeIdentity) -> Option<NodeInstance> {
        let label = CrdsLabel {
            origin: *identity,
            kind: NODE_INSTANCE_KIND,
        };
        let entry = self.entries.get(&label)?;
        match entry.value.data() {
            CrdsData::NodeInstance(instance) => Some(instance.clone()),
            _ => None,
        }
    }

    /// The contact record advertising `addr` as its gossip address.
    pub fn find_by_gossip_addr(&self, addr: SocketAddr) -> Option<ContactInfo> {
        self.entries.iter().find_map(|entry| {
            entry
                .value
                .contact_info()
                .filter(|info| info.gossip == addr)
                .cloned()
        })
    }

    /// Every stored contact record, regardless of age.
    pub fn contacts(&self) -> Vec<ContactInfo> {
        self.entries
            .iter()
            .filter_map(|entry| entry.value.contact_info().cloned())
            .collect()
    }

    /// Hashes of every stored value, for pull-request digests.
    pub fn hashes(&self) -> Vec<[u8; 32]> {
        self.entries.iter().map(|entry| *entry.value.hash()).collect()
    }

    /// Every stored value with its local timestamp.
    pub fn values(&self) -> Vec<(CrdsValue, u64)> {
        self.entries
            .iter()
            .map(|entry| (entry.value.clone(), entry.local_timestamp))
            .collect()
    }

    /// Values inserted after `cursor`, oldest first, plus the cursor to use
    /// next time.
    pub fn values_since(&self, cursor: u64) -> (Vec<CrdsValue>, u64) {
        let mut fresh: Vec<(u64, CrdsValue)> = self
            .entries
            .iter()
            .filter(|entry| entry.ordinal > cursor)
            .map(|entry| (entry.ordinal, entry.value.clone()))
            .collect();
        fresh.sort_unstable_by_key(|(ordinal, _)| *ordinal);
        let next = fresh.last().map_or(cursor, |(ordinal, _)| *ordinal);
        (fresh.into_iter().map(|(_, value)| value).collect(), next)
    }

    /// Number of stored values of every kind.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of stored contact records.
    pub fn num_contacts(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.key().kind == CONTACT_INFO_KIND)
            .count()
    }

    /// The configured eviction timeout.
    pub fn entry_timeout(&self) -> Duration {
        self.entry_timeout
    }
}

fn contact_label(identity: &NodeIdentity) -> CrdsLabel {
    CrdsLabel {
        origin: *identity,
        kind: CONTACT_INFO_KIND,
    }
}
