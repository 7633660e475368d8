//! Ping/Pong liveness bookkeeping.
//!
//! A self-reported contact record proves nothing about the address in it.
//! Before we serve pull requests to a peer or treat it as live, it has to
//! answer a signed ping at its claimed gossip address. The cache remembers
//! outstanding tokens, which (identity, address) pairs have answered, and
//! when we last pinged each address so we never flood one.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

use super::wire::{pong_hash, Ping, Pong};
use crate::config::{PING_RATE_LIMIT, PING_TTL};
use crate::crypto::{NodeIdentity, NodeKeypair};

#[derive(Debug)]
struct PendingPing {
    addr: SocketAddr,
    sent_at: u64,
}

#[derive(Debug, Default)]
struct Inner {
    /// Outstanding pings, keyed by the hash a valid pong must carry.
    pending: HashMap<[u8; 32], PendingPing>,
    /// When each (identity, address) pair last answered.
    verified: HashMap<(NodeIdentity, SocketAddr), u64>,
    /// When each address was last pinged.
    last_ping: HashMap<SocketAddr, u64>,
}

/// Tracks ping tokens and verified peers.
#[derive(Debug)]
pub struct PingCache {
    ttl: u64,
    rate_limit: u64,
    inner: Mutex<Inner>,
}

impl Default for PingCache {
    fn default() -> Self {
        Self::new(PING_TTL, PING_RATE_LIMIT)
    }
}

impl PingCache {
    pub fn new(ttl: Duration, rate_limit: Duration) -> Self {
        Self {
            ttl: ttl.as_millis() as u64,
            rate_limit: rate_limit.as_millis() as u64,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Whether `identity` has answered a ping at `addr` within the TTL.
    ///
    /// Also returns a ping to send when the peer is unverified, or when its
    /// verification is past half its TTL and should be refreshed before it
    /// lapses. Pings to one address are rate limited.
    pub fn check<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        keypair: &NodeKeypair,
        identity: NodeIdentity,
        addr: SocketAddr,
        now: u64,
    ) -> (bool, Option<Ping>) {
        let mut inner = self.inner.lock();
        let age = inner
            .verified
            .get(&(identity, addr))
            .map(|at| now.saturating_sub(*at));
        let verified = age.is_some_and(|age| age < self.ttl);
        let wants_ping = age.map_or(true, |age| age >= self.ttl / 2);
        let ping = if wants_ping {
            self.new_ping(&mut inner, rng, keypair, addr, now)
        } else {
            None
        };
        (verified, ping)
    }

    /// A rate-limited ping to an address whose identity we may not know yet.
    pub fn ping_addr<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        keypair: &NodeKeypair,
        addr: SocketAddr,
        now: u64,
    ) -> Option<Ping> {
        let mut inner = self.inner.lock();
        self.new_ping(&mut inner, rng, keypair, addr, now)
    }

    /// Records a pong received from `addr`. Returns true if it answered one
    /// of our outstanding pings sent to that same address.
    pub fn on_pong(&self, pong: &Pong, addr: SocketAddr, now: u64) -> bool {
        let mut inner = self.inner.lock();
        let matches = inner.pending.get(pong.hash()).is_some_and(|pending| {
            pending.addr == addr && now.saturating_sub(pending.sent_at) < self.ttl
        });
        if !matches {
            return false;
        }
        inner.pending.remove(pong.hash());
        inner.verified.insert((pong.from(), addr), now);
        true
    }

    /// Forgets expired tokens and verifications.
    pub fn purge(&self, now: u64) {
        let ttl = self.ttl;
        let rate_limit = self.rate_limit;
        let mut inner = self.inner.lock();
        inner
            .pending
            .retain(|_, pending| now.saturating_sub(pending.sent_at) < ttl);
        inner
            .verified
            .retain(|_, at| now.saturating_sub(*at) < ttl);
        inner
            .last_ping
            .retain(|_, at| now.saturating_sub(*at) < rate_limit);
    }

    /// Number of verified (identity, address) pairs.
    pub fn num_verified(&self) -> usize {
        self.inner.lock().verified.len()
    }

    fn new_ping<R: Rng + ?Sized>(
        &self,
        inner: &mut Inner,
        rng: &mut R,
        keypair: &NodeKeypair,
        addr: SocketAddr,
        now: u64,
    ) -> Option<Ping> {
        if let Some(last) = inner.last_ping.get(&addr) {
            if now.saturating_sub(*last) < self.rate_limit {
                return None;
            }
        }
        let ping = Ping::random(rng, keypair);
        inner.last_ping.insert(addr, now);
        inner.pending.insert(
            pong_hash(ping.token()),
            PendingPing { addr, sent_at: now },
        );
        Some(ping)
    }
}
