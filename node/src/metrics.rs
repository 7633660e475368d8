//! # Prometheus Metrics
//!
//! Exposes the gossip engine's counters, directory and ranking sizes, and
//! stake fetch health at `/metrics`.
//!
//! All metrics are registered in a dedicated [`prometheus::Registry`] with
//! the `stakescope` prefix so they do not collide with any default global
//! registry consumers. Values are sampled from the engine on every scrape.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use stakescope::gossip::GossipStatsSnapshot;
use stakescope::stake::{FetchStatus, StakeSnapshot};

use crate::api::AppState;

/// Gossip counters mirrored from [`stakescope::gossip::GossipStats`].
#[derive(Clone)]
struct GossipCounters {
    packets_received: IntCounter,
    packets_dropped: IntCounter,
    invalid_signatures: IntCounter,
    values_accepted: IntCounter,
    pull_requests_sent: IntCounter,
    pull_responses_received: IntCounter,
    push_messages_sent: IntCounter,
    push_messages_received: IntCounter,
    prunes_sent: IntCounter,
    prunes_received: IntCounter,
    pings_sent: IntCounter,
    pongs_verified: IntCounter,
    entries_evicted: IntCounter,
    send_failures: IntCounter,
}

/// Holds all Prometheus metric handles for the node.
///
/// Clone-friendly (prometheus handles are `Arc`s internally) so it can be
/// shared across request handlers.
#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    gossip: GossipCounters,
    pub directory_entries: IntGauge,
    pub live_contacts: IntGauge,
    pub ranked_nodes: IntGauge,
    pub foreign_nodes: IntGauge,
    pub gossip_silent: IntGauge,
    pub duplicate_instance: IntGauge,
    stake_fetch_successes: IntCounter,
    stake_fetch_failures: IntCounter,
    pub stake_epoch: IntGauge,
    pub stake_snapshot_age_seconds: IntGauge,
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("stakescope".into()), None)?;

        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let metric = IntCounter::new(name, help)?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };
        let gauge = |name: &str, help: &str| -> Result<IntGauge, prometheus::Error> {
            let metric = IntGauge::new(name, help)?;
            registry.register(Box::new(metric.clone()))?;
            Ok(metric)
        };

        let gossip = GossipCounters {
            packets_received: counter("gossip_packets_received_total", "Datagrams received")?,
            packets_dropped: counter(
                "gossip_packets_dropped_total",
                "Datagrams dropped as malformed, oversized or forged",
            )?,
            invalid_signatures: counter(
                "gossip_invalid_signatures_total",
                "Messages or values that failed signature verification",
            )?,
            values_accepted: counter(
                "gossip_values_accepted_total",
                "Values stored in the contact directory",
            )?,
            pull_requests_sent: counter("gossip_pull_requests_sent_total", "Pull requests sent")?,
            pull_responses_received: counter(
                "gossip_pull_responses_received_total",
                "Pull responses received",
            )?,
            push_messages_sent: counter("gossip_push_messages_sent_total", "Push messages sent")?,
            push_messages_received: counter(
                "gossip_push_messages_received_total",
                "Push messages received",
            )?,
            prunes_sent: counter("gossip_prunes_sent_total", "Prune messages sent")?,
            prunes_received: counter("gossip_prunes_received_total", "Valid prunes received")?,
            pings_sent: counter("gossip_pings_sent_total", "Pings sent")?,
            pongs_verified: counter(
                "gossip_pongs_verified_total",
                "Pongs that verified a peer address",
            )?,
            entries_evicted: counter(
                "gossip_entries_evicted_total",
                "Directory entries evicted for inactivity",
            )?,
            send_failures: counter(
                "gossip_send_failures_total",
                "Sends abandoned after a timeout or socket error",
            )?,
        };

        Ok(Self {
            gossip,
            directory_entries: gauge("directory_entries", "Values in the contact directory")?,
            live_contacts: gauge("live_contacts", "Contact records updated recently")?,
            ranked_nodes: gauge("ranked_nodes", "Nodes in the current ranking")?,
            foreign_nodes: gauge("foreign_nodes", "Live nodes on a foreign shred version")?,
            gossip_silent: gauge("gossip_silent", "1 while no valid gossip traffic arrives")?,
            duplicate_instance: gauge(
                "duplicate_instance",
                "1 once another process runs with our identity",
            )?,
            stake_fetch_successes: counter(
                "stake_fetch_successes_total",
                "Successful stake fetches",
            )?,
            stake_fetch_failures: counter("stake_fetch_failures_total", "Failed stake fetches")?,
            stake_epoch: gauge("stake_epoch", "Epoch of the current stake snapshot")?,
            stake_snapshot_age_seconds: gauge(
                "stake_snapshot_age_seconds",
                "Seconds since the current stake snapshot was fetched",
            )?,
            registry,
        })
    }

    /// Copies cumulative engine counters into their Prometheus mirrors.
    pub fn record_gossip(&self, stats: &GossipStatsSnapshot) {
        let g = &self.gossip;
        sync_counter(&g.packets_received, stats.packets_received);
        sync_counter(&g.packets_dropped, stats.packets_dropped);
        sync_counter(&g.invalid_signatures, stats.invalid_signatures);
        sync_counter(&g.values_accepted, stats.values_accepted);
        sync_counter(&g.pull_requests_sent, stats.pull_requests_sent);
        sync_counter(&g.pull_responses_received, stats.pull_responses_received);
        sync_counter(&g.push_messages_sent, stats.push_messages_sent);
        sync_counter(&g.push_messages_received, stats.push_messages_received);
        sync_counter(&g.prunes_sent, stats.prunes_sent);
        sync_counter(&g.prunes_received, stats.prunes_received);
        sync_counter(&g.pings_sent, stats.pings_sent);
        sync_counter(&g.pongs_verified, stats.pongs_verified);
        sync_counter(&g.entries_evicted, stats.entries_evicted);
        sync_counter(&g.send_failures, stats.send_failures);
        self.gossip_silent.set(i64::from(stats.silent));
        self.duplicate_instance.set(i64::from(stats.duplicate_instance));
    }

    pub fn record_stake(&self, status: &FetchStatus, snapshot: Option<&StakeSnapshot>, now: u64) {
        sync_counter(&self.stake_fetch_successes, status.successes);
        sync_counter(&self.stake_fetch_failures, status.failures);
        if let Some(snapshot) = snapshot {
            self.stake_epoch.set(clamp(snapshot.epoch));
            self.stake_snapshot_age_seconds
                .set(clamp(now.saturating_sub(snapshot.fetched_at) / 1_000));
        }
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

/// Raises a counter to `value`. Counters never go down.
fn sync_counter(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

fn clamp(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Shared metrics state passed to axum handlers.
pub type SharedMetrics = Arc<NodeMetrics>;

/// Axum handler that renders `/metrics` in Prometheus text format.
///
/// Returns HTTP 500 if encoding fails (should never happen in practice).
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.sample_metrics();
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
