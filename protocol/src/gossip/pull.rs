//! # Pull Anti-Entropy
//!
//! Pull is the slow, thorough half of gossip. Every round we pick a few
//! peers, biased toward the ones we have not pulled from for a while, and
//! send each our membership digest. They answer with the values we lack.
//! Pull is what lets a freshly started node learn the whole cluster, and
//! what repairs anything push lost.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::Rng;

use super::bloom::{build_filters, CrdsFilter};
use super::crds::CrdsValue;
use super::directory::ContactDirectory;
use crate::config::{MAX_PULL_RESPONSE_VALUES, PULL_FANOUT, PULL_INTERVAL};
use crate::crypto::NodeIdentity;

/// Weight given to a peer we have never pulled from, in units of pull
/// intervals. Peers pulled from recently score lower.
const MAX_PULL_STALENESS: u64 = 16;

/// Pull-side state of one gossip node.
#[derive(Debug)]
pub struct PullState {
    fanout: usize,
    max_response_values: usize,
    interval_ms: u64,
    last_pulled: Mutex<HashMap<SocketAddr, u64>>,
}

impl Default for PullState {
    fn default() -> Self {
        Self::new(PULL_FANOUT, MAX_PULL_RESPONSE_VALUES, PULL_INTERVAL)
    }
}

impl PullState {
    pub fn new(fanout: usize, max_response_values: usize, interval: Duration) -> Self {
        Self {
            fanout,
            max_response_values,
            interval_ms: (interval.as_millis() as u64).max(1),
            last_pulled: Mutex::new(HashMap::new()),
        }
    }

    /// Chooses up to `fanout` distinct peer addresses, weighted by how long
    /// ago each was last pulled from.
    pub fn select_peers<R: Rng + ?Sized>(
        &self,
        candidates: &[SocketAddr],
        now: u64,
        rng: &mut R,
    ) -> Vec<SocketAddr> {
        let mut last_pulled = self.last_pulled.lock();
        let mut pool: Vec<(SocketAddr, u64)> = candidates
            .iter()
            .map(|addr| {
                let staleness = last_pulled.get(addr).map_or(MAX_PULL_STALENESS, |at| {
                    (now.saturating_sub(*at) / self.interval_ms).min(MAX_PULL_STALENESS)
                });
                (*addr, staleness + 1)
            })
            .collect();

        let mut chosen = Vec::with_capacity(self.fanout.min(pool.len()));
        while chosen.len() < self.fanout && !pool.is_empty() {
            let Ok(dist) = WeightedIndex::new(pool.iter().map(|(_, weight)| *weight)) else {
                break;
            };
            let (addr, _) = pool.swap_remove(dist.sample(rng));
            last_pulled.insert(addr, now);
            chosen.push(addr);
        }
        chosen
    }

    /// The membership digest of everything in `directory`, one filter per
    /// pull request.
    pub fn build_filters<R: Rng + ?Sized>(
        &self,
        directory: &ContactDirectory,
        rng: &mut R,
    ) -> Vec<CrdsFilter> {
        let hashes = directory.hashes();
        build_filters(rng, hashes.iter(), hashes.len())
    }

    /// Values `caller` is missing according to `filter`, freshest first,
    /// truncated to the response limit. Never returns the caller's own values:
    /// it is the authority on those.
    pub fn serve(
        &self,
        directory: &ContactDirectory,
        filter: &CrdsFilter,
        caller: &NodeIdentity,
    ) -> Vec<CrdsValue> {
        let mut missing: Vec<CrdsValue> = directory
            .values()
            .into_iter()
            .map(|(value, _)| value)
            .filter(|value| value.origin() != *caller && filter.is_missing(value.hash()))
            .collect();
        missing.sort_unstable_by(|a, b| {
            b.wallclock()
                .cmp(&a.wallclock())
                .then_with(|| a.origin().cmp(&b.origin()))
        });
        missing.truncate(self.max_response_values);
        missing
    }

    /// Forgets pull history for addresses no longer in `known`.
    pub fn retain(&self, known: &[SocketAddr]) {
        self.last_pulled.lock().retain(|addr, _| known.contains(addr));
    }
}
