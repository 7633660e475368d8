//! # Push Bookkeeping
//!
//! Push spreads fresh values fast: every value new to our directory is
//! forwarded to up to `fanout` random peers. Three pieces of state keep that
//! from turning into a broadcast storm:
//!
//! - a **cursor** into the directory's insertion order, so each value is
//!   considered for pushing once;
//! - a **pushed window** of (peer, value hash) pairs, so we never send a
//!   peer a value it sent us or that we sent it recently;
//! - **prunes**: a peer that receives an origin's values over too many
//!   paths asks the redundant senders to stop, and we honour that until the
//!   prune times out.
//!
//! The receiving side of prunes lives here too: we score which peers deliver
//! each origin first and, during maintenance, prune the rest.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;

use super::crds::CrdsValue;
use super::directory::ContactDirectory;
use crate::config::{
    MAX_PRUNE_ORIGINS, MIN_INGRESS_NODES, PRUNE_TIMEOUT, PUSHED_WINDOW, PUSH_FANOUT,
    PUSH_MSG_TIMEOUT,
};
use crate::crypto::NodeIdentity;

/// Tunables for [`PushState`].
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub fanout: usize,
    pub pushed_window: Duration,
    pub prune_timeout: Duration,
    pub msg_timeout: Duration,
    pub min_ingress_nodes: usize,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            fanout: PUSH_FANOUT,
            pushed_window: PUSHED_WINDOW,
            prune_timeout: PRUNE_TIMEOUT,
            msg_timeout: PUSH_MSG_TIMEOUT,
            min_ingress_nodes: MIN_INGRESS_NODES,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct IngressScore {
    /// Times this peer delivered the origin's value before anyone else.
    first: u32,
    /// Times it delivered something we already had.
    redundant: u32,
}

#[derive(Debug, Default)]
struct Inner {
    cursor: u64,
    pushed: HashMap<(NodeIdentity, [u8; 32]), u64>,
    /// pruner -> origin -> prune expiry.
    pruned: HashMap<NodeIdentity, HashMap<NodeIdentity, u64>>,
    /// origin -> delivering peer -> score.
    ingress: HashMap<NodeIdentity, HashMap<NodeIdentity, IngressScore>>,
}

/// Push-side state of one gossip node.
#[derive(Debug)]
pub struct PushState {
    config: PushConfig,
    inner: Mutex<Inner>,
}

impl PushState {
    pub fn new(config: PushConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Picks up everything inserted since the last round and assigns each
    /// value up to `fanout` eligible peers. Returns one value batch per peer.
    pub fn new_push_messages<R: Rng + ?Sized>(
        &self,
        directory: &ContactDirectory,
        peers: &[(NodeIdentity, SocketAddr)],
        now: u64,
        rng: &mut R,
    ) -> Vec<(NodeIdentity, SocketAddr, Vec<CrdsValue>)> {
        let mut inner = self.inner.lock();
        let (values, cursor) = directory.values_since(inner.cursor);
        inner.cursor = cursor;
        if peers.is_empty() {
            return Vec::new();
        }

        let msg_timeout = self.config.msg_timeout.as_millis() as u64;
        let window = self.config.pushed_window.as_millis() as u64;
        let mut order: Vec<usize> = (0..peers.len()).collect();
        order.shuffle(rng);

        let mut batches: HashMap<usize, Vec<CrdsValue>> = HashMap::new();
        for value in values {
            if now.abs_diff(value.wallclock()) > msg_timeout {
                continue;
            }
            let origin = value.origin();
            let mut sent = 0;
            for &index in &order {
                if sent >= self.config.fanout {
                    break;
                }
                let (peer, _) = peers[index];
                if peer == origin || is_pruned(&inner, &peer, &origin, now) {
                    continue;
                }
                let key = (peer, *value.hash());
                if inner
                    .pushed
                    .get(&key)
                    .is_some_and(|at| now.saturating_sub(*at) < window)
                {
                    continue;
                }
                inner.pushed.insert(key, now);
                batches.entry(index).or_default().push(value.clone());
                sent += 1;
            }
        }

        batches
            .into_iter()
            .map(|(index, values)| (peers[index].0, peers[index].1, values))
            .collect()
    }

    /// Remembers that `from` pushed us `value`, so we never push it back,
    /// and scores `from` as a delivery path for the value's origin.
    pub fn on_push_received(&self, from: NodeIdentity, value: &CrdsValue, fresh: bool, now: u64) {
        let mut inner = self.inner.lock();
        inner.pushed.insert((from, *value.hash()), now);
        let score = inner
            .ingress
            .entry(value.origin())
            .or_default()
            .entry(from)
            .or_default();
        if fresh {
            score.first += 1;
        } else {
            score.redundant += 1;
        }
    }

    /// Honours a verified prune: stop pushing `origins` to `pruner`.
    pub fn on_prune(&self, pruner: NodeIdentity, origins: &[NodeIdentity], now: u64) {
        let expiry = now + self.config.prune_timeout.as_millis() as u64;
        let mut inner = self.inner.lock();
        let entry = inner.pruned.entry(pruner).or_default();
        for origin in origins {
            entry.insert(*origin, expiry);
        }
    }

    /// Whether `pruner` currently has `origin` pruned.
    pub fn is_pruned(&self, pruner: &NodeIdentity, origin: &NodeIdentity, now: u64) -> bool {
        is_pruned(&self.inner.lock(), pruner, origin, now)
    }

    /// Drains the ingress scores and decides whom to prune.
    ///
    /// For each origin delivered by more than `min_ingress_nodes` peers, the
    /// best `min_ingress_nodes` paths are kept and every other peer is told
    /// to stop. Never prunes our own origin or an origin's direct push.
    pub fn take_prunes(&self, self_id: &NodeIdentity) -> HashMap<NodeIdentity, Vec<NodeIdentity>> {
        let ingress = std::mem::take(&mut self.inner.lock().ingress);
        let keep = self.config.min_ingress_nodes;
        let mut prunes: HashMap<NodeIdentity, Vec<NodeIdentity>> = HashMap::new();

        for (origin, scores) in ingress {
            if origin == *self_id || scores.len() <= keep {
                continue;
            }
            let mut ranked: Vec<(NodeIdentity, IngressScore)> = scores.into_iter().collect();
            ranked.sort_by(|(a_id, a), (b_id, b)| {
                b.first
                    .cmp(&a.first)
                    .then(a.redundant.cmp(&b.redundant))
                    .then(a_id.cmp(b_id))
            });
            for (peer, _) in ranked.into_iter().skip(keep) {
                if peer == origin {
                    continue;
                }
                let list = prunes.entry(peer).or_default();
                if list.len() < MAX_PRUNE_ORIGINS {
                    list.push(origin);
                }
            }
        }
        prunes
    }

    /// Forgets expired pushed-window entries and prunes.
    pub fn purge(&self, now: u64) {
        let window = self.config.pushed_window.as_millis() as u64;
        let mut inner = self.inner.lock();
        inner
            .pushed
            .retain(|_, at| now.saturating_sub(*at) < window);
        inner.pruned.retain(|_, origins| {
            origins.retain(|_, expiry| *expiry > now);
            !origins.is_empty()
        });
    }
}

fn is_pruned(inner: &Inner, pruner: &NodeIdentity, origin: &NodeIdentity, now: u64) -> bool {
    inner
        .pruned
        .get(pruner)
        .and_then(|origins| origins.get(origin))
        .is_some_and(|expiry| *expiry > now)
}
