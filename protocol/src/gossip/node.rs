//! # Gossip Node
//!
//! The gossip engine as a message-driven state machine. [`GossipNode`] owns
//! no socket and no timer: the driver hands it packets and clock ticks, and
//! it hands back the packets to send ([`Outbound`]). That keeps every
//! protocol decision testable with a fake clock, a seeded RNG and a handful
//! of nodes wired together in memory.
//!
//! ## Inputs
//!
//! | call | when |
//! |------|------|
//! | [`GossipNode::bootstrap`] | once, at start |
//! | [`GossipNode::handle_packet`] | every datagram received |
//! | [`GossipNode::pull_round`] | every `pull_interval` |
//! | [`GossipNode::push_round`] | every `push_interval` |
//! | [`GossipNode::maintenance`] | every `maintenance_interval` |
//!
//! ## Packet pipeline
//!
//! decode -> sanitize -> verify signatures -> dispatch. A failure at any
//! stage drops the packet (or the individual value) and bumps a counter.
//! Nothing that arrives over the network can make these calls fail.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use super::bloom::CrdsFilter;
use super::crds::{
    is_valid_address, ContactInfo, CrdsData, CrdsLabel, CrdsValue, NodeInstance,
    CONTACT_INFO_KIND,
};
use super::directory::{ContactDirectory, UpsertError};
use super::error::ProtocolError;
use super::ping::PingCache;
use super::pull::PullState;
use super::push::{PushConfig, PushState};
use super::wire::{self, Pong, Protocol, PruneData};
use crate::config;
use crate::crypto::{NodeIdentity, NodeKeypair};
use crate::shred::{Compatibility, ShredVersionFilter};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tunables of the gossip engine.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub pull_interval: Duration,
    pub push_interval: Duration,
    pub maintenance_interval: Duration,
    /// How often our own records are re-signed.
    pub refresh_interval: Duration,
    /// Entries without an update for this long are evicted.
    pub entry_timeout: Duration,
    pub push_fanout: usize,
    pub pull_fanout: usize,
    pub max_pull_response_values: usize,
    pub pushed_window: Duration,
    pub prune_timeout: Duration,
    pub push_msg_timeout: Duration,
    pub min_ingress_nodes: usize,
    pub ping_ttl: Duration,
    pub ping_rate_limit: Duration,
    pub max_pings_per_round: usize,
    /// Every UDP send is abandoned after this long.
    pub send_timeout: Duration,
    /// No valid packet for this long raises the silence warning.
    pub silence_threshold: Duration,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            pull_interval: config::PULL_INTERVAL,
            push_interval: config::PUSH_INTERVAL,
            maintenance_interval: config::MAINTENANCE_INTERVAL,
            refresh_interval: config::REFRESH_INTERVAL,
            entry_timeout: config::ENTRY_TIMEOUT,
            push_fanout: config::PUSH_FANOUT,
            pull_fanout: config::PULL_FANOUT,
            max_pull_response_values: config::MAX_PULL_RESPONSE_VALUES,
            pushed_window: config::PUSHED_WINDOW,
            prune_timeout: config::PRUNE_TIMEOUT,
            push_msg_timeout: config::PUSH_MSG_TIMEOUT,
            min_ingress_nodes: config::MIN_INGRESS_NODES,
            ping_ttl: config::PING_TTL,
            ping_rate_limit: config::PING_RATE_LIMIT,
            max_pings_per_round: config::MAX_PINGS_PER_ROUND,
            send_timeout: config::SEND_TIMEOUT,
            silence_threshold: config::SILENCE_THRESHOLD,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Counters and flags describing the engine's health. Shared with the
/// driver and the metrics exporter.
#[derive(Debug, Default)]
pub struct GossipStats {
    pub packets_received: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub invalid_signatures: AtomicU64,
    pub values_accepted: AtomicU64,
    pub values_rejected: AtomicU64,
    pub pull_requests_sent: AtomicU64,
    pub pull_requests_served: AtomicU64,
    pub pull_responses_received: AtomicU64,
    pub push_messages_sent: AtomicU64,
    pub push_messages_received: AtomicU64,
    pub prunes_sent: AtomicU64,
    pub prunes_received: AtomicU64,
    pub pings_sent: AtomicU64,
    pub pongs_sent: AtomicU64,
    pub pongs_verified: AtomicU64,
    pub entries_evicted: AtomicU64,
    pub send_failures: AtomicU64,
    /// Local time of the last packet that passed verification.
    pub last_valid_packet_ms: AtomicU64,
    /// Set while no valid packet has arrived for the silence threshold.
    pub silent: AtomicBool,
    /// Set once another process is seen running with our identity.
    pub duplicate_instance: AtomicBool,
}

/// A point-in-time copy of [`GossipStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GossipStatsSnapshot {
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub invalid_signatures: u64,
    pub values_accepted: u64,
    pub values_rejected: u64,
    pub pull_requests_sent: u64,
    pub pull_requests_served: u64,
    pub pull_responses_received: u64,
    pub push_messages_sent: u64,
    pub push_messages_received: u64,
    pub prunes_sent: u64,
    pub prunes_received: u64,
    pub pings_sent: u64,
    pub pongs_sent: u64,
    pub pongs_verified: u64,
    pub entries_evicted: u64,
    pub send_failures: u64,
    pub last_valid_packet_ms: u64,
    pub silent: bool,
    pub duplicate_instance: bool,
}

impl GossipStats {
    pub fn snapshot(&self) -> GossipStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        GossipStatsSnapshot {
            packets_received: load(&self.packets_received),
            packets_dropped: load(&self.packets_dropped),
            invalid_signatures: load(&self.invalid_signatures),
            values_accepted: load(&self.values_accepted),
            values_rejected: load(&self.values_rejected),
            pull_requests_sent: load(&self.pull_requests_sent),
            pull_requests_served: load(&self.pull_requests_served),
            pull_responses_received: load(&self.pull_responses_received),
            push_messages_sent: load(&self.push_messages_sent),
            push_messages_received: load(&self.push_messages_received),
            prunes_sent: load(&self.prunes_sent),
            prunes_received: load(&self.prunes_received),
            pings_sent: load(&self.pings_sent),
            pongs_sent: load(&self.pongs_sent),
            pongs_verified: load(&self.pongs_verified),
            entries_evicted: load(&self.entries_evicted),
            send_failures: load(&self.send_failures),
            last_valid_packet_ms: load(&self.last_valid_packet_ms),
            silent: self.silent.load(Ordering::Relaxed),
            duplicate_instance: self.duplicate_instance.load(Ordering::Relaxed),
        }
    }
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// One datagram the driver should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub addr: SocketAddr,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Gossip Node
// ---------------------------------------------------------------------------

/// The gossip engine of one node.
pub struct GossipNode {
    config: GossipConfig,
    keypair: Arc<NodeKeypair>,
    directory: Arc<ContactDirectory>,
    shred_filter: Arc<ShredVersionFilter>,
    self_info: RwLock<ContactInfo>,
    instance: NodeInstance,
    entrypoints: Vec<SocketAddr>,
    ping_cache: PingCache,
    push: PushState,
    pull: PullState,
    stats: Arc<GossipStats>,
    last_refresh: AtomicU64,
}

impl GossipNode {
    /// Builds the engine and publishes our own records into `directory`.
    ///
    /// `self_info` is the contact record we advertise; its identity must be
    /// the keypair's. `entrypoints` are the seed gossip addresses.
    #[allow(clippy::too_many_arguments)]
    pub fn new<R: Rng + ?Sized>(
        config: GossipConfig,
        keypair: Arc<NodeKeypair>,
        self_info: ContactInfo,
        entrypoints: Vec<SocketAddr>,
        directory: Arc<ContactDirectory>,
        shred_filter: Arc<ShredVersionFilter>,
        now: u64,
        rng: &mut R,
    ) -> Self {
        let instance = NodeInstance::new(keypair.identity(), rng.gen(), now);
        let push = PushState::new(PushConfig {
            fanout: config.push_fanout,
            pushed_window: config.pushed_window,
            prune_timeout: config.prune_timeout,
            msg_timeout: config.push_msg_timeout,
            min_ingress_nodes: config.min_ingress_nodes,
        });
        let pull = PullState::new(
            config.pull_fanout,
            config.max_pull_response_values,
            config.pull_interval,
        );
        let ping_cache = PingCache::new(config.ping_ttl, config.ping_rate_limit);
        let stats = Arc::new(GossipStats::default());
        stats.last_valid_packet_ms.store(now, Ordering::Relaxed);

        let node = Self {
            config,
            keypair,
            directory,
            shred_filter,
            self_info: RwLock::new(self_info),
            instance,
            entrypoints,
            ping_cache,
            push,
            pull,
            stats,
            last_refresh: AtomicU64::new(now),
        };
        node.refresh_self(now);
        node
    }

    pub fn identity(&self) -> NodeIdentity {
        self.keypair.identity()
    }

    pub fn config(&self) -> &GossipConfig {
        &self.config
    }

    pub fn directory(&self) -> &Arc<ContactDirectory> {
        &self.directory
    }

    pub fn shred_filter(&self) -> &Arc<ShredVersionFilter> {
        &self.shred_filter
    }

    pub fn stats(&self) -> &Arc<GossipStats> {
        &self.stats
    }

    /// Our currently advertised contact record.
    pub fn self_info(&self) -> ContactInfo {
        self.self_info.read().clone()
    }

    /// The seed addresses this node bootstraps from.
    pub fn entrypoints(&self) -> &[SocketAddr] {
        &self.entrypoints
    }

    /// First contact: ping every entrypoint and send each a pull request.
    pub fn bootstrap<R: Rng + ?Sized>(&self, now: u64, rng: &mut R) -> Vec<Outbound> {
        let mut out = Vec::new();
        for addr in &self.entrypoints {
            if let Some(ping) = self.ping_cache.ping_addr(rng, &self.keypair, *addr, now) {
                bump(&self.stats.pings_sent);
                self.push_encoded(&mut out, *addr, &Protocol::PingMessage(ping));
            }
        }
        out.extend(self.pull_requests(&self.entrypoints, now, rng));
        info!(entrypoints = self.entrypoints.len(), "gossip bootstrap sent");
        out
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Processes one datagram from `from`.
    pub fn handle_packet<R: Rng + ?Sized>(
        &self,
        from: SocketAddr,
        bytes: &[u8],
        now: u64,
        rng: &mut R,
    ) -> Vec<Outbound> {
        bump(&self.stats.packets_received);
        let message = match wire::decode(bytes).and_then(|m| m.sanitize().map(|()| m)) {
            Ok(message) => message,
            Err(err) => {
                bump(&self.stats.packets_dropped);
                debug!(peer = %from, error = %err, "dropping packet");
                return Vec::new();
            }
        };
        let kind = message.kind();
        let Some(message) = message.verify_signatures() else {
            bump(&self.stats.packets_dropped);
            bump(&self.stats.invalid_signatures);
            trace!(peer = %from, kind, error = %ProtocolError::InvalidSignature, "dropping packet");
            return Vec::new();
        };

        self.stats.last_valid_packet_ms.store(now, Ordering::Relaxed);
        if self.stats.silent.swap(false, Ordering::Relaxed) {
            info!(peer = %from, "gossip traffic resumed");
        }

        match message {
            Protocol::PullRequest(filter, caller) => {
                self.handle_pull_request(from, &filter, caller, now, rng)
            }
            Protocol::PullResponse(_, values) => {
                bump(&self.stats.pull_responses_received);
                // Never re-admit a record older than the eviction window.
                let max_age = self.config.entry_timeout.as_millis() as u64;
                for value in values {
                    if now.saturating_sub(value.wallclock()) > max_age {
                        bump(&self.stats.values_rejected);
                        continue;
                    }
                    self.accept_value(value, now);
                }
                Vec::new()
            }
            Protocol::PushMessage(sender, values) => {
                bump(&self.stats.push_messages_received);
                let max_skew = self.config.push_msg_timeout.as_millis() as u64;
                for value in values {
                    if now.abs_diff(value.wallclock()) > max_skew {
                        bump(&self.stats.values_rejected);
                        continue;
                    }
                    let fresh = self.accept_value(value.clone(), now);
                    self.push.on_push_received(sender, &value, fresh, now);
                }
                Vec::new()
            }
            Protocol::PruneMessage(_, data) => {
                self.handle_prune(from, &data, now);
                Vec::new()
            }
            Protocol::PingMessage(ping) => {
                let mut out = Vec::new();
                let pong = Pong::new(&ping, &self.keypair);
                bump(&self.stats.pongs_sent);
                self.push_encoded(&mut out, from, &Protocol::PongMessage(pong));
                out
            }
            Protocol::PongMessage(pong) => {
                if self.ping_cache.on_pong(&pong, from, now) {
                    bump(&self.stats.pongs_verified);
                    self.directory.promote(&pong.from(), from, now);
                    trace!(peer = %from, identity = %pong.from(), "peer verified");
                }
                Vec::new()
            }
        }
    }

    fn handle_pull_request<R: Rng + ?Sized>(
        &self,
        from: SocketAddr,
        filter: &CrdsFilter,
        caller: CrdsValue,
        now: u64,
        rng: &mut R,
    ) -> Vec<Outbound> {
        let caller_id = caller.origin();
        if caller_id == self.identity() {
            return Vec::new();
        }
        self.accept_value(caller, now);

        let mut out = Vec::new();
        let (verified, ping) = self
            .ping_cache
            .check(rng, &self.keypair, caller_id, from, now);
        if let Some(ping) = ping {
            bump(&self.stats.pings_sent);
            self.push_encoded(&mut out, from, &Protocol::PingMessage(ping));
        }
        if !verified {
            trace!(peer = %from, "pull request from unverified caller");
            return out;
        }

        let values = self.pull.serve(&self.directory, filter, &caller_id);
        bump(&self.stats.pull_requests_served);
        let self_id = self.identity();
        for message in wire::split_into_messages(values, |batch| {
            Protocol::PullResponse(self_id, batch)
        }) {
            self.push_encoded(&mut out, from, &message);
        }
        out
    }

    fn handle_prune(&self, from: SocketAddr, data: &PruneData, now: u64) {
        if data.destination != self.identity() {
            bump(&self.stats.packets_dropped);
            debug!(peer = %from, error = %ProtocolError::Misaddressed, "dropping prune");
            return;
        }
        if now.abs_diff(data.wallclock) > self.config.prune_timeout.as_millis() as u64 {
            bump(&self.stats.packets_dropped);
            debug!(peer = %from, wallclock = data.wallclock, "dropping expired prune");
            return;
        }
        bump(&self.stats.prunes_received);
        self.push.on_prune(data.pubkey, &data.prunes, now);
    }

    /// Stores one verified value and reacts to what it says. Returns true if
    /// the directory took it.
    fn accept_value(&self, value: CrdsValue, now: u64) -> bool {
        let data = value.data().clone();
        match self.directory.upsert(value, now) {
            Ok(_) => {
                bump(&self.stats.values_accepted);
                match data {
                    CrdsData::ContactInfo(info) => self.on_contact_info(&info, now),
                    CrdsData::NodeInstance(instance) => self.on_node_instance(&instance),
                    CrdsData::Unrecognized { .. } => {}
                }
                true
            }
            Err(UpsertError::InvalidSignature) => {
                bump(&self.stats.invalid_signatures);
                false
            }
            Err(err) => {
                bump(&self.stats.values_rejected);
                trace!(error = %err, "value not stored");
                false
            }
        }
    }

    fn on_contact_info(&self, info: &ContactInfo, now: u64) {
        if info.identity == self.identity() || !self.entrypoints.contains(&info.gossip) {
            return;
        }
        if self.shred_filter.observe(info.shred_version) {
            debug!(
                entrypoint = %info.gossip,
                shred_version = info.shred_version,
                "re-signing with adopted shred version"
            );
            self.refresh_self(now);
        }
    }

    fn on_node_instance(&self, other: &NodeInstance) {
        if self.instance.is_superseded_by(other)
            && !self.stats.duplicate_instance.swap(true, Ordering::Relaxed)
        {
            error!(
                identity = %self.identity(),
                token = other.token,
                "another instance is running with this identity"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Sends our membership digest to a few peers.
    ///
    /// Until gossip has produced any compatible peer, the entrypoints are
    /// the only candidates.
    pub fn pull_round<R: Rng + ?Sized>(&self, now: u64, rng: &mut R) -> Vec<Outbound> {
        let mut candidates: Vec<SocketAddr> =
            self.gossip_peers(now).into_iter().map(|(_, addr)| addr).collect();
        if candidates.is_empty() {
            candidates = self.entrypoints.clone();
        }
        let targets = self.pull.select_peers(&candidates, now, rng);
        self.pull_requests(&targets, now, rng)
    }

    /// Pushes values new since the last round to a bounded fan-out.
    pub fn push_round<R: Rng + ?Sized>(&self, now: u64, rng: &mut R) -> Vec<Outbound> {
        let peers = self.gossip_peers(now);
        let self_id = self.identity();
        let mut out = Vec::new();
        for (_, addr, values) in self.push.new_push_messages(&self.directory, &peers, now, rng) {
            for message in
                wire::split_into_messages(values, |batch| Protocol::PushMessage(self_id, batch))
            {
                bump(&self.stats.push_messages_sent);
                self.push_encoded(&mut out, addr, &message);
            }
        }
        out
    }

    /// Periodic housekeeping: self refresh, eviction, liveness pings,
    /// prunes and the silence watchdog.
    pub fn maintenance<R: Rng + ?Sized>(&self, now: u64, rng: &mut R) -> Vec<Outbound> {
        let refresh_ms = self.config.refresh_interval.as_millis() as u64;
        if now.saturating_sub(self.last_refresh.load(Ordering::Relaxed)) >= refresh_ms {
            self.refresh_self(now);
        }

        let evicted = self.directory.evict_stale(now);
        self.stats
            .entries_evicted
            .fetch_add(evicted as u64, Ordering::Relaxed);
        self.ping_cache.purge(now);
        self.push.purge(now);

        let mut out = Vec::new();
        self.ping_unverified(&mut out, now, rng);
        self.send_prunes(&mut out, now);
        self.check_silence(now);
        out
    }

    fn ping_unverified<R: Rng + ?Sized>(&self, out: &mut Vec<Outbound>, now: u64, rng: &mut R) {
        let self_id = self.identity();
        let mut known = Vec::new();
        let mut sent = 0;
        for live in self.directory.live_entries(self.config.entry_timeout, now) {
            let info = live.info;
            if info.identity == self_id || !is_valid_address(&info.gossip) {
                continue;
            }
            known.push(info.gossip);
            if sent >= self.config.max_pings_per_round {
                continue;
            }
            let (_, ping) = self
                .ping_cache
                .check(rng, &self.keypair, info.identity, info.gossip, now);
            if let Some(ping) = ping {
                sent += 1;
                bump(&self.stats.pings_sent);
                self.push_encoded(out, info.gossip, &Protocol::PingMessage(ping));
            }
        }
        known.extend_from_slice(&self.entrypoints);
        self.pull.retain(&known);
    }

    fn send_prunes(&self, out: &mut Vec<Outbound>, now: u64) {
        for (peer, origins) in self.push.take_prunes(&self.identity()) {
            let Some(info) = self.directory.get_contact(&peer) else {
                continue;
            };
            let data = PruneData::new(&self.keypair, origins, peer, now);
            bump(&self.stats.prunes_sent);
            self.push_encoded(out, info.gossip, &Protocol::PruneMessage(data.pubkey, data));
        }
    }

    fn check_silence(&self, now: u64) {
        let last = self.stats.last_valid_packet_ms.load(Ordering::Relaxed);
        let silent_for = now.saturating_sub(last);
        if silent_for >= self.config.silence_threshold.as_millis() as u64
            && !self.stats.silent.swap(true, Ordering::Relaxed)
        {
            warn!(
                silent_for_ms = silent_for,
                entrypoints = self.entrypoints.len(),
                "no valid gossip traffic received; cluster may be unreachable"
            );
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Re-signs our contact and instance records with wallclock `now` and
    /// the current canonical shred version.
    pub fn refresh_self(&self, now: u64) {
        self.last_refresh.store(now, Ordering::Relaxed);
        let info = {
            let mut info = self.self_info.write();
            info.wallclock = now.max(info.wallclock + 1);
            if let Some(canonical) = self.shred_filter.canonical() {
                info.shred_version = canonical;
            }
            info.clone()
        };
        let wallclock = info.wallclock;
        let records = [
            CrdsData::ContactInfo(info),
            CrdsData::NodeInstance(self.instance.with_wallclock(wallclock)),
        ];
        for data in records {
            let result = CrdsValue::new_signed(data, &self.keypair)
                .and_then(CrdsValue::into_verified)
                .map(|value| self.directory.insert(value, now));
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => debug!(error = %err, "own record not stored"),
                Err(err) => error!(error = %err, "cannot sign own record"),
            }
        }
    }

    /// Live, compatible peers with a usable gossip address, excluding us.
    fn gossip_peers(&self, now: u64) -> Vec<(NodeIdentity, SocketAddr)> {
        let self_id = self.identity();
        self.directory
            .live_entries(self.config.entry_timeout, now)
            .filter(|live| {
                live.info.identity != self_id
                    && is_valid_address(&live.info.gossip)
                    && self.shred_filter.classify(&live.info) == Compatibility::Compatible
            })
            .map(|live| (live.info.identity, live.info.gossip))
            .collect()
    }

    fn pull_requests<R: Rng + ?Sized>(
        &self,
        targets: &[SocketAddr],
        now: u64,
        rng: &mut R,
    ) -> Vec<Outbound> {
        if targets.is_empty() {
            return Vec::new();
        }
        let label = CrdsLabel {
            origin: self.identity(),
            kind: CONTACT_INFO_KIND,
        };
        let caller = match self.directory.get(&label) {
            Some(value) => value,
            None => {
                self.refresh_self(now);
                let Some(value) = self.directory.get(&label) else {
                    return Vec::new();
                };
                value
            }
        };

        let filters = self.pull.build_filters(&self.directory, rng);
        let mut out = Vec::with_capacity(targets.len() * filters.len());
        for addr in targets {
            for filter in &filters {
                bump(&self.stats.pull_requests_sent);
                let request = Protocol::PullRequest(filter.clone(), caller.clone());
                self.push_encoded(&mut out, *addr, &request);
            }
        }
        out
    }

    fn push_encoded(&self, out: &mut Vec<Outbound>, addr: SocketAddr, message: &Protocol) {
        match wire::encode(message) {
            Ok(payload) => out.push(Outbound { addr, payload }),
            Err(err) => {
                warn!(peer = %addr, kind = message.kind(), error = %err, "cannot encode message")
            }
        }
    }
}

impl std::fmt::Debug for GossipNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipNode")
            .field("identity", &self.identity())
            .field("entrypoints", &self.entrypoints)
            .field("directory_len", &self.directory.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gossip::wire::Ping;
    use crate::shred::ShredVersionPolicy;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const START: u64 = 1_700_000_000_000;

    struct Harness {
        node: GossipNode,
        addr: SocketAddr,
        keypair: Arc<NodeKeypair>,
    }

    fn harness(port: u16, shred: u16, entrypoints: Vec<SocketAddr>) -> Harness {
        let mut rng = StdRng::seed_from_u64(u64::from(port));
        let keypair = Arc::new(NodeKeypair::generate());
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let mut info = ContactInfo::new(keypair.identity(), addr, START);
        info.shred_version = shred;
        let filter = ShredVersionFilter::new(ShredVersionPolicy::PreferOverride, Some(shred));
        let node = GossipNode::new(
            GossipConfig::default(),
            keypair.clone(),
            info,
            entrypoints,
            Arc::new(ContactDirectory::default()),
            Arc::new(filter),
            START,
            &mut rng,
        );
        Harness {
            node,
            addr,
            keypair,
        }
    }

    fn decode_all(out: &[Outbound]) -> Vec<Protocol> {
        out.iter().map(|o| wire::decode(&o.payload).unwrap()).collect()
    }

    #[test]
    fn own_records_are_published_on_start() {
        let h = harness(9001, 3, vec![]);
        assert_eq!(h.node.directory().len(), 2);
        let info = h.node.directory().get_contact(&h.keypair.identity()).unwrap();
        assert_eq!(info.shred_version, 3);
    }

    #[test]
    fn bootstrap_pings_and_pulls_each_entrypoint() {
        let seeds: Vec<SocketAddr> = vec![
            "10.0.0.1:8001".parse().unwrap(),
            "10.0.0.2:8001".parse().unwrap(),
        ];
        let h = harness(9002, 3, seeds.clone());
        let mut rng = StdRng::seed_from_u64(1);
        let out = h.node.bootstrap(START, &mut rng);

        for seed in &seeds {
            let kinds: Vec<&str> = out
                .iter()
                .filter(|o| o.addr == *seed)
                .map(|o| wire::decode(&o.payload).unwrap().kind())
                .collect();
            assert!(kinds.contains(&"ping"));
            assert!(kinds.contains(&"pull_request"));
        }
    }

    #[test]
    fn garbage_is_dropped_and_counted() {
        let h = harness(9003, 3, vec![]);
        let mut rng = StdRng::seed_from_u64(2);
        let out = h.node.handle_packet("10.0.0.9:1".parse().unwrap(), &[1, 2, 3], START, &mut rng);
        assert!(out.is_empty());
        assert_eq!(h.node.stats().snapshot().packets_dropped, 1);
    }

    #[test]
    fn ping_is_answered_with_pong() {
        let h = harness(9004, 3, vec![]);
        let mut rng = StdRng::seed_from_u64(3);
        let peer = NodeKeypair::generate();
        let ping = Ping::new([5u8; 32], &peer);
        let bytes = wire::encode(&Protocol::PingMessage(ping.clone())).unwrap();
        let from: SocketAddr = "10.0.0.9:8001".parse().unwrap();

        let out = h.node.handle_packet(from, &bytes, START, &mut rng);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].addr, from);
        match wire::decode(&out[0].payload).unwrap() {
            Protocol::PongMessage(pong) => {
                assert_eq!(pong.hash(), &wire::pong_hash(ping.token()));
                assert_eq!(pong.from(), h.keypair.identity());
            }
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[test]
    fn pull_request_from_unverified_peer_gets_a_ping_only() {
        let server = harness(9005, 3, vec![]);
        let client = harness(9006, 3, vec![server.addr]);
        let mut rng = StdRng::seed_from_u64(4);

        let requests: Vec<Outbound> = client
            .node
            .pull_round(START, &mut rng)
            .into_iter()
            .filter(|o| o.addr == server.addr)
            .collect();
        assert!(!requests.is_empty());

        let replies = server
            .node
            .handle_packet(client.addr, &requests[0].payload, START, &mut rng);
        let kinds: Vec<&str> = decode_all(&replies).iter().map(Protocol::kind).collect();
        assert_eq!(kinds, vec!["ping"]);
        // The caller's own record was still learned.
        assert!(server.node.directory().get_contact(&client.keypair.identity()).is_some());
    }

    #[test]
    fn verified_caller_receives_missing_values() {
        let server = harness(9007, 3, vec![]);
        let client = harness(9008, 3, vec![server.addr]);
        let mut rng = StdRng::seed_from_u64(5);

        // Server knows a third node the client does not.
        let third = NodeKeypair::generate();
        let mut info = ContactInfo::new(third.identity(), "10.3.3.3:8001".parse().unwrap(), START);
        info.shred_version = 3;
        server
            .node
            .directory()
            .upsert(CrdsValue::new_signed(CrdsData::ContactInfo(info), &third).unwrap(), START)
            .unwrap();

        // First request: server pings, client pongs, server verifies client.
        let request = client.node.pull_round(START, &mut rng).remove(0);
        let ping = server.node.handle_packet(client.addr, &request.payload, START, &mut rng);
        let pong = client.node.handle_packet(server.addr, &ping[0].payload, START, &mut rng);
        server.node.handle_packet(client.addr, &pong[0].payload, START, &mut rng);
        assert!(server.node.directory().is_verified(&client.keypair.identity(), START));

        // Second request is served.
        let responses =
            server
                .node
                .handle_packet(client.addr, &request.payload, START + 10, &mut rng);
        assert!(decode_all(&responses).iter().all(|m| m.kind() == "pull_response"));
        for response in &responses {
            client.node.handle_packet(server.addr, &response.payload, START + 10, &mut rng);
        }
        assert!(client.node.directory().get_contact(&third.identity()).is_some());
        assert!(client.node.directory().get_contact(&server.keypair.identity()).is_some());
    }

    #[test]
    fn shred_version_is_adopted_from_entrypoint() {
        let mut rng = StdRng::seed_from_u64(6);
        let seed_kp = NodeKeypair::generate();
        let seed_addr: SocketAddr = "10.0.0.1:8001".parse().unwrap();
        let keypair = Arc::new(NodeKeypair::generate());
        let node = GossipNode::new(
            GossipConfig::default(),
            keypair.clone(),
            ContactInfo::new(keypair.identity(), "127.0.0.1:9010".parse().unwrap(), START),
            vec![seed_addr],
            Arc::new(ContactDirectory::default()),
            Arc::new(ShredVersionFilter::default()),
            START,
            &mut rng,
        );
        assert_eq!(node.shred_filter().canonical(), None);

        let mut seed_info = ContactInfo::new(seed_kp.identity(), seed_addr, START);
        seed_info.shred_version = 4242;
        let value = CrdsValue::new_signed(CrdsData::ContactInfo(seed_info), &seed_kp).unwrap();
        let bytes = wire::encode(&Protocol::PushMessage(seed_kp.identity(), vec![value])).unwrap();
        node.handle_packet(seed_addr, &bytes, START + 1, &mut rng);

        assert_eq!(node.shred_filter().canonical(), Some(4242));
        assert_eq!(node.self_info().shred_version, 4242);
        let published = node.directory().get_contact(&keypair.identity()).unwrap();
        assert_eq!(published.shred_version, 4242);
    }

    #[test]
    fn duplicate_instance_raises_flag() {
        let h = harness(9011, 3, vec![]);
        let mut rng = StdRng::seed_from_u64(7);
        let other = NodeInstance::new(h.keypair.identity(), rng.gen(), START + 5_000);
        let value = CrdsValue::new_signed(CrdsData::NodeInstance(other), &h.keypair).unwrap();
        let bytes =
            wire::encode(&Protocol::PushMessage(h.keypair.identity(), vec![value])).unwrap();

        h.node
            .handle_packet("10.0.0.5:8001".parse().unwrap(), &bytes, START + 5_000, &mut rng);
        assert!(h.node.stats().snapshot().duplicate_instance);
    }

    #[test]
    fn misaddressed_prune_is_ignored() {
        let h = harness(9012, 3, vec![]);
        let mut rng = StdRng::seed_from_u64(8);
        let pruner = NodeKeypair::generate();
        let origin = NodeKeypair::generate().identity();
        let elsewhere = NodeKeypair::generate().identity();

        let data = PruneData::new(&pruner, vec![origin], elsewhere, START);
        let bytes = wire::encode(&Protocol::PruneMessage(pruner.identity(), data)).unwrap();
        h.node
            .handle_packet("10.0.0.5:8001".parse().unwrap(), &bytes, START, &mut rng);
        assert_eq!(h.node.stats().snapshot().prunes_received, 0);

        let data = PruneData::new(&pruner, vec![origin], h.keypair.identity(), START);
        let bytes = wire::encode(&Protocol::PruneMessage(pruner.identity(), data)).unwrap();
        h.node
            .handle_packet("10.0.0.5:8001".parse().unwrap(), &bytes, START, &mut rng);
        assert_eq!(h.node.stats().snapshot().prunes_received, 1);
        assert!(h.node.push.is_pruned(&pruner.identity(), &origin, START + 1));
    }

    #[test]
    fn silence_warning_sets_and_clears() {
        let h = harness(9013, 3, vec![]);
        let mut rng = StdRng::seed_from_u64(9);
        let threshold = h.node.config().silence_threshold.as_millis() as u64;

        h.node.maintenance(START + threshold - 1, &mut rng);
        assert!(!h.node.stats().snapshot().silent);
        h.node.maintenance(START + threshold, &mut rng);
        assert!(h.node.stats().snapshot().silent);

        let peer = NodeKeypair::generate();
        let bytes = wire::encode(&Protocol::PingMessage(Ping::new([1; 32], &peer))).unwrap();
        let from: SocketAddr = "10.0.0.5:8001".parse().unwrap();
        h.node
            .handle_packet(from, &bytes, START + threshold + 1, &mut rng);
        assert!(!h.node.stats().snapshot().silent);
    }

    #[test]
    fn maintenance_refreshes_self_and_evicts_others() {
        let h = harness(9014, 3, vec![]);
        let mut rng = StdRng::seed_from_u64(10);
        let other = NodeKeypair::generate();
        let info = ContactInfo::new(other.identity(), "10.4.4.4:8001".parse().unwrap(), START);
        h.node
            .directory()
            .upsert(CrdsValue::new_signed(CrdsData::ContactInfo(info), &other).unwrap(), START)
            .unwrap();

        // Keep ourselves fresh across the eviction window.
        let timeout = h.node.config().entry_timeout.as_millis() as u64;
        let step = h.node.config().refresh_interval.as_millis() as u64;
        let mut now = START;
        while now <= START + timeout + step {
            now += step;
            h.node.maintenance(now, &mut rng);
        }

        assert!(h.node.directory().get_contact(&other.identity()).is_none());
        let own = h.node.directory().get_contact(&h.keypair.identity()).unwrap();
        assert!(own.wallclock > START);
    }

    #[test]
    fn expired_values_are_not_taken_back() {
        let h = harness(9016, 3, vec![]);
        let mut rng = StdRng::seed_from_u64(12);
        let dead = NodeKeypair::generate();
        let info = ContactInfo::new(dead.identity(), "10.6.6.6:8001".parse().unwrap(), START);
        let value = CrdsValue::new_signed(CrdsData::ContactInfo(info), &dead).unwrap();
        let timeout = h.node.config().entry_timeout.as_millis() as u64;
        let later = START + timeout + 1;

        let pulled =
            wire::encode(&Protocol::PullResponse(dead.identity(), vec![value.clone()])).unwrap();
        h.node
            .handle_packet("10.0.0.5:8001".parse().unwrap(), &pulled, later, &mut rng);
        let pushed = wire::encode(&Protocol::PushMessage(dead.identity(), vec![value])).unwrap();
        h.node
            .handle_packet("10.0.0.5:8001".parse().unwrap(), &pushed, later, &mut rng);

        assert!(h.node.directory().get_contact(&dead.identity()).is_none());
        assert_eq!(h.node.stats().snapshot().values_rejected, 2);
    }

    #[test]
    fn push_round_forwards_new_values_to_compatible_peers() {
        let h = harness(9015, 3, vec![]);
        let mut rng = StdRng::seed_from_u64(11);
        let mut peer_ids = Vec::new();
        for i in 0..3u8 {
            let kp = NodeKeypair::generate();
            let addr = SocketAddr::from(([10, 5, 0, i], 8001));
            let mut info = ContactInfo::new(kp.identity(), addr, START);
            info.shred_version = if i == 2 { 99 } else { 3 };
            let value = CrdsValue::new_signed(CrdsData::ContactInfo(info.clone()), &kp).unwrap();
            h.node.directory().upsert(value, START).unwrap();
            peer_ids.push(info.gossip);
        }

        let out = h.node.push_round(START, &mut rng);
        assert!(!out.is_empty());
        assert!(out.iter().all(|o| o.addr != peer_ids[2]));
        assert!(decode_all(&out).iter().all(|m| m.kind() == "push"));
    }
}
