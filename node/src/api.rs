//! # HTTP API
//!
//! Builds the axum router that serves the ranking. All endpoints share
//! application state through axum's `State` extractor and compute their
//! answer from the live directory and the current stake snapshot on every
//! request.
//!
//! ## Endpoints
//!
//! | Method | Path                  | Description                              |
//! |--------|-----------------------|------------------------------------------|
//! | GET    | `/v1/ranked`          | Live compatible nodes ranked by stake    |
//! | GET    | `/v1/allowlist/full`  | Per-node port descriptors with stake     |
//! | GET    | `/v1/allowlist/short` | Staked/unstaked IPv4 /24 networks        |
//! | GET    | `/v1/foreign`         | Live nodes on another shred version      |
//! | GET    | `/v1/status`          | Engine counters and stake fetch status   |
//! | GET    | `/v1/health`          | 200 while gossip traffic is flowing      |
//! | GET    | `/metrics`            | Prometheus exposition                    |

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use stakescope::clock::Clock;
use stakescope::config::BASE_UNITS_PER_TOKEN;
use stakescope::gossip::{
    ContactInfo, GossipNode, GossipStatsSnapshot, Service, ServiceAddr, Transport,
};
use stakescope::ranking::{self, foreign_entries, RankedNode, RankingConfig};
use stakescope::stake::{FetchStatus, SnapshotCell, StakeFetcher};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::metrics::{metrics_handler, SharedMetrics};

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone: everything is behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub gossip: Arc<GossipNode>,
    pub stakes: Arc<SnapshotCell>,
    pub fetcher: Arc<StakeFetcher>,
    pub ranking: RankingConfig,
    pub clock: Arc<dyn Clock>,
    pub metrics: SharedMetrics,
    /// `/v1/health` fails once gossip has been quiet this long.
    pub health_window: Duration,
}

impl AppState {
    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn ranked(&self) -> Vec<RankedNode> {
        ranking::rank(
            self.gossip.directory(),
            self.gossip.shred_filter(),
            &self.stakes.current(),
            &self.ranking,
            self.now(),
        )
    }

    /// Refreshes every gauge and counter from the engine.
    pub fn sample_metrics(&self) {
        let now = self.now();
        let directory = self.gossip.directory();
        let metrics = &self.metrics;
        metrics.record_gossip(&self.gossip.stats().snapshot());
        metrics.record_stake(
            &self.fetcher.status(),
            self.stakes.latest().as_deref(),
            now,
        );
        metrics.directory_entries.set(directory.len() as i64);
        metrics
            .live_contacts
            .set(directory.live_entries(self.ranking.max_age, now).count() as i64);
        metrics.ranked_nodes.set(self.ranked().len() as i64);
        metrics.foreign_nodes.set(
            foreign_entries(directory, self.gossip.shred_filter(), self.ranking.max_age, now).len()
                as i64,
        );
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/", get(root_handler))
        .route("/v1/ranked", get(ranked_handler))
        .route("/v1/allowlist", get(allowlist_full_handler))
        .route("/v1/allowlist/full", get(allowlist_full_handler))
        .route("/v1/allowlist/short", get(allowlist_short_handler))
        .route("/v1/foreign", get(foreign_handler))
        .route("/v1/status", get(status_handler))
        .route("/v1/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// One entry of `GET /v1/ranked`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RankedNodeResponse {
    pub rank: usize,
    /// Base58 identity.
    pub identity: String,
    pub stake: u64,
    pub reachable: bool,
    pub gossip: Option<SocketAddr>,
    pub rpc: Option<SocketAddr>,
    pub shred_version: Option<u16>,
    pub version: Option<String>,
    pub services: Vec<ServiceAddr>,
}

impl From<RankedNode> for RankedNodeResponse {
    fn from(node: RankedNode) -> Self {
        let info = node.contact_info;
        Self {
            rank: node.rank,
            identity: node.identity.to_base58(),
            stake: node.stake,
            reachable: node.reachable,
            gossip: info.as_ref().map(|i| i.gossip),
            rpc: info.as_ref().and_then(|i| i.rpc),
            shred_version: info.as_ref().map(|i| i.shred_version),
            version: info.as_ref().map(|i| i.version.to_string()),
            services: info.map(|i| i.services).unwrap_or_default(),
        }
    }
}

/// A firewall rule hint for one advertised port.
#[derive(Debug, Clone, Serialize)]
pub struct PortDescriptor {
    /// `"UDP"` or `"QUIC"`.
    pub protocol: &'static str,
    pub address: SocketAddr,
    /// Suggested rate limit.
    pub max_mbps: u64,
    /// Only staked peers have a reason to send here.
    pub staked_only: bool,
}

impl PortDescriptor {
    fn quic(address: SocketAddr) -> Self {
        Self {
            protocol: "QUIC",
            address,
            max_mbps: 100,
            staked_only: false,
        }
    }

    fn udp_gossip(address: SocketAddr) -> Self {
        Self {
            protocol: "UDP",
            address,
            max_mbps: 50,
            staked_only: false,
        }
    }

    fn udp_control(address: SocketAddr) -> Self {
        Self {
            protocol: "UDP",
            address,
            max_mbps: 10,
            staked_only: true,
        }
    }

    fn udp_bulk(address: SocketAddr) -> Self {
        Self {
            protocol: "UDP",
            address,
            max_mbps: 200,
            staked_only: true,
        }
    }
}

/// One entry of `GET /v1/allowlist/full`.
#[derive(Debug, Serialize)]
pub struct AllowlistEntry {
    /// Base58 identity.
    pub identity: String,
    pub stake: u64,
    pub gossip: PortDescriptor,
    pub serve_repair: Option<PortDescriptor>,
    pub turbine: Option<PortDescriptor>,
    pub tpu_quic: Option<PortDescriptor>,
    pub tpu_forwards_quic: Option<PortDescriptor>,
    pub tpu_vote: Option<PortDescriptor>,
    pub tpu_vote_quic: Option<PortDescriptor>,
    pub alpenglow: Option<PortDescriptor>,
}

impl AllowlistEntry {
    fn new(info: &ContactInfo, stake: u64) -> Self {
        let port = |service, transport, describe: fn(SocketAddr) -> PortDescriptor| {
            info.service(service, transport).map(describe)
        };
        Self {
            identity: info.identity.to_base58(),
            stake,
            gossip: PortDescriptor::udp_gossip(info.gossip),
            serve_repair: port(Service::ServeRepair, Transport::Udp, PortDescriptor::udp_bulk),
            turbine: port(Service::Tvu, Transport::Udp, PortDescriptor::udp_bulk),
            tpu_quic: port(Service::Tpu, Transport::Quic, PortDescriptor::quic),
            tpu_forwards_quic: port(Service::TpuForwards, Transport::Quic, PortDescriptor::quic),
            tpu_vote: port(Service::TpuVote, Transport::Udp, PortDescriptor::udp_control),
            tpu_vote_quic: port(Service::TpuVote, Transport::Quic, PortDescriptor::quic),
            alpenglow: port(Service::Alpenglow, Transport::Udp, PortDescriptor::udp_control),
        }
    }
}

/// Response payload for `GET /v1/allowlist/short`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AllowlistShortResponse {
    pub staked: Vec<Ipv4Addr>,
    pub unstaked: Vec<Ipv4Addr>,
}

/// One entry of `GET /v1/foreign`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ForeignNodeResponse {
    pub identity: String,
    pub shred_version: u16,
    pub gossip: SocketAddr,
    pub last_updated_ms: u64,
}

/// Response payload for `GET /v1/health`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub gossip_age_ms: u64,
    /// `None` until the first stake fetch succeeds.
    pub stake_age_ms: Option<u64>,
    pub stake_epoch: Option<u64>,
}

/// Response payload for `GET /v1/status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub identity: String,
    pub version: String,
    pub canonical_shred_version: Option<u16>,
    pub directory_entries: usize,
    pub contacts: usize,
    pub gossip: GossipStatsSnapshot,
    pub stake: FetchStatus,
    pub timestamp: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn root_handler() -> impl IntoResponse {
    "stakescope: see /v1/ranked"
}

#[derive(Debug, Deserialize)]
struct RankedParams {
    limit: Option<usize>,
}

/// `GET /v1/ranked[?limit=N]`
async fn ranked_handler(
    State(state): State<AppState>,
    Query(params): Query<RankedParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(usize::MAX);
    let body: Vec<RankedNodeResponse> = state
        .ranked()
        .into_iter()
        .take(limit)
        .map(RankedNodeResponse::from)
        .collect();
    Json(body)
}

/// `GET /v1/allowlist/full`: every reachable ranked node, in rank order.
async fn allowlist_full_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body: Vec<AllowlistEntry> = state
        .ranked()
        .into_iter()
        .filter_map(|node| {
            node.contact_info
                .map(|info| AllowlistEntry::new(&info, node.stake))
        })
        .collect();
    Json(body)
}

#[derive(Debug, Deserialize)]
struct AllowlistShortParams {
    /// Whole tokens. Nodes with strictly more stake are "staked".
    stake_threshold: Option<u64>,
}

/// `GET /v1/allowlist/short[?stake_threshold=N]`
async fn allowlist_short_handler(
    State(state): State<AppState>,
    Query(params): Query<AllowlistShortParams>,
) -> impl IntoResponse {
    let threshold = params
        .stake_threshold
        .unwrap_or(1)
        .saturating_mul(BASE_UNITS_PER_TOKEN);
    let mut response = AllowlistShortResponse::default();
    for node in state.ranked() {
        let Some(info) = node.contact_info else {
            continue;
        };
        if node.stake > threshold {
            response.staked.extend(info.all_ipv4());
        } else {
            response.unstaked.extend(info.all_ipv4());
        }
    }
    aggregate_into_24s(&mut response.staked);
    aggregate_into_24s(&mut response.unstaked);
    Json(response)
}

/// `GET /v1/foreign`
async fn foreign_handler(State(state): State<AppState>) -> impl IntoResponse {
    let foreign = foreign_entries(
        state.gossip.directory(),
        state.gossip.shred_filter(),
        state.ranking.max_age,
        state.now(),
    );
    let body: Vec<ForeignNodeResponse> = foreign
        .into_iter()
        .map(|live| ForeignNodeResponse {
            identity: live.info.identity.to_base58(),
            shred_version: live.info.shred_version,
            gossip: live.info.gossip,
            last_updated_ms: live.last_updated,
        })
        .collect();
    Json(body)
}

/// `GET /v1/status`
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let directory = state.gossip.directory();
    Json(StatusResponse {
        identity: state.gossip.identity().to_base58(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        canonical_shred_version: state.gossip.shred_filter().canonical(),
        directory_entries: directory.len(),
        contacts: directory.num_contacts(),
        gossip: state.gossip.stats().snapshot(),
        stake: state.fetcher.status(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

/// `GET /v1/health`: 500 once no valid gossip packet arrived within the
/// health window.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let now = state.now();
    let stats = state.gossip.stats().snapshot();
    let gossip_age_ms = now.saturating_sub(stats.last_valid_packet_ms);
    let snapshot = state.stakes.latest();
    let healthy = gossip_age_ms < state.health_window.as_millis() as u64;
    let body = HealthResponse {
        healthy,
        gossip_age_ms,
        stake_age_ms: snapshot.as_ref().map(|s| now.saturating_sub(s.fetched_at)),
        stake_epoch: snapshot.as_ref().map(|s| s.epoch),
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (status, Json(body))
}

/// Replaces `addrs` with the sorted, distinct /24 networks containing them.
pub fn aggregate_into_24s(addrs: &mut Vec<Ipv4Addr>) {
    let nets: BTreeSet<Ipv4Addr> = addrs
        .iter()
        .map(|ip| {
            let [a, b, c, _] = ip.octets();
            Ipv4Addr::new(a, b, c, 0)
        })
        .collect();
    addrs.clear();
    addrs.extend(nets);
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use stakescope::clock::ManualClock;
    use stakescope::crypto::NodeKeypair;
    use stakescope::gossip::{
        ContactDirectory, ContactInfo, CrdsData, CrdsValue, GossipConfig, Service, Transport,
    };
    use stakescope::stake::{RpcConfig, RpcStakeSource, StakeFetcherConfig, StakeSnapshot};
    use stakescope::{ShredVersionFilter, ShredVersionPolicy};
    use std::collections::HashMap;
    use tower::ServiceExt;

    const NOW: u64 = 1_700_000_000_000;
    const TOKEN: u64 = BASE_UNITS_PER_TOKEN;

    struct Fixture {
        router: Router,
        state: AppState,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(NOW));
        let keypair = Arc::new(NodeKeypair::generate());
        let node = GossipNode::new(
            GossipConfig::default(),
            keypair.clone(),
            ContactInfo::new(keypair.identity(), "127.0.0.1:8001".parse().unwrap(), NOW),
            vec![],
            Arc::new(ContactDirectory::default()),
            Arc::new(ShredVersionFilter::new(ShredVersionPolicy::OverrideOnly, Some(1))),
            NOW,
            &mut StdRng::seed_from_u64(1),
        );
        let stakes = Arc::new(SnapshotCell::new());
        // Never polled in these tests.
        let source = RpcStakeSource::new(RpcConfig::new("http://127.0.0.1:9/")).unwrap();
        let fetcher = Arc::new(StakeFetcher::new(
            StakeFetcherConfig::default(),
            Arc::new(source),
            stakes.clone(),
            clock.clone(),
        ));
        let state = AppState {
            gossip: Arc::new(node),
            stakes,
            fetcher,
            ranking: RankingConfig {
                exclude: Some(keypair.identity()),
                ..RankingConfig::default()
            },
            clock: clock.clone(),
            metrics: Arc::new(crate::metrics::NodeMetrics::new().unwrap()),
            health_window: Duration::from_secs(10),
        };
        Fixture {
            router: create_router(state.clone()),
            state,
            clock,
        }
    }

    /// Publishes a peer into the directory and returns its keypair.
    fn add_peer(state: &AppState, ip: [u8; 4], shred: u16) -> NodeKeypair {
        let kp = NodeKeypair::generate();
        let mut info = ContactInfo::new(kp.identity(), SocketAddr::from((ip, 8001)), NOW);
        info.shred_version = shred;
        info.set_service(
            Service::Tpu,
            Transport::Quic,
            SocketAddr::from(([ip[0], ip[1], ip[2], ip[3].wrapping_add(1)], 8009)),
        );
        let value = CrdsValue::new_signed(CrdsData::ContactInfo(info), &kp).unwrap();
        state.gossip.directory().upsert(value, NOW).unwrap();
        kp
    }

    fn set_stakes(state: &AppState, stakes: &[(&NodeKeypair, u64)]) {
        let map: HashMap<_, _> = stakes.iter().map(|(kp, s)| (kp.identity(), *s)).collect();
        state.stakes.replace(StakeSnapshot::new(7, NOW, map));
    }

    /// Sends a GET request and returns the (status, body_bytes).
    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    #[tokio::test]
    async fn ranked_orders_by_stake_and_hides_foreign() {
        let f = fixture();
        let a = add_peer(&f.state, [10, 0, 1, 1], 1);
        let b = add_peer(&f.state, [10, 0, 2, 1], 1);
        let c = add_peer(&f.state, [10, 0, 3, 1], 2);
        set_stakes(&f.state, &[(&a, 100), (&b, 50), (&c, 200)]);

        let (status, body) = get(&f.router, "/v1/ranked").await;
        assert_eq!(status, StatusCode::OK);
        let ranked: Vec<RankedNodeResponse> = serde_json::from_slice(&body).unwrap();
        let ids: Vec<&str> = ranked.iter().map(|r| r.identity.as_str()).collect();
        assert_eq!(ids, vec![a.identity().to_base58(), b.identity().to_base58()]);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[0].shred_version, Some(1));
        assert_eq!(ranked[0].services.len(), 1);

        let (_, body) = get(&f.router, "/v1/ranked?limit=1").await;
        let ranked: Vec<RankedNodeResponse> = serde_json::from_slice(&body).unwrap();
        assert_eq!(ranked.len(), 1);

        let (_, body) = get(&f.router, "/v1/foreign").await;
        let foreign: Vec<ForeignNodeResponse> = serde_json::from_slice(&body).unwrap();
        assert_eq!(foreign.len(), 1);
        assert_eq!(foreign[0].identity, c.identity().to_base58());
        assert_eq!(foreign[0].shred_version, 2);
    }

    #[tokio::test]
    async fn allowlist_splits_by_threshold_and_aggregates() {
        let f = fixture();
        let whale = add_peer(&f.state, [10, 1, 1, 5], 1);
        let minnow = add_peer(&f.state, [10, 2, 2, 5], 1);
        add_peer(&f.state, [10, 3, 3, 5], 1);
        set_stakes(&f.state, &[(&whale, 5_000 * TOKEN), (&minnow, TOKEN / 2)]);

        let (status, body) = get(&f.router, "/v1/allowlist/short").await;
        assert_eq!(status, StatusCode::OK);
        let allow: AllowlistShortResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(allow.staked, vec![Ipv4Addr::new(10, 1, 1, 0)]);
        assert_eq!(
            allow.unstaked,
            vec![Ipv4Addr::new(10, 2, 2, 0), Ipv4Addr::new(10, 3, 3, 0)]
        );

        let (_, body) = get(&f.router, "/v1/allowlist/short?stake_threshold=10000").await;
        let allow: AllowlistShortResponse = serde_json::from_slice(&body).unwrap();
        assert!(allow.staked.is_empty());
        assert_eq!(allow.unstaked.len(), 3);
    }

    #[tokio::test]
    async fn full_allowlist_describes_every_advertised_port() {
        let f = fixture();
        let whale = add_peer(&f.state, [10, 1, 1, 5], 1);
        let minnow = add_peer(&f.state, [10, 2, 2, 5], 1);
        set_stakes(&f.state, &[(&whale, 5_000 * TOKEN), (&minnow, TOKEN)]);

        // Give the whale a full set of validator ports.
        let mut info = f.state.gossip.directory().get_contact(&whale.identity()).unwrap();
        info.wallclock += 1;
        let ip = [10, 1, 1, 5];
        info.set_service(Service::Tvu, Transport::Udp, SocketAddr::from((ip, 8002)));
        info.set_service(Service::ServeRepair, Transport::Udp, SocketAddr::from((ip, 8003)));
        info.set_service(Service::TpuVote, Transport::Udp, SocketAddr::from((ip, 8004)));
        info.set_service(Service::TpuVote, Transport::Quic, SocketAddr::from((ip, 8005)));
        info.set_service(Service::Alpenglow, Transport::Udp, SocketAddr::from((ip, 8006)));
        let value = CrdsValue::new_signed(CrdsData::ContactInfo(info), &whale).unwrap();
        f.state.gossip.directory().upsert(value, NOW).unwrap();

        for path in ["/v1/allowlist/full", "/v1/allowlist"] {
            let (status, body) = get(&f.router, path).await;
            assert_eq!(status, StatusCode::OK);
            let entries: Vec<serde_json::Value> = serde_json::from_slice(&body).unwrap();
            assert_eq!(entries.len(), 2);

            let top = &entries[0];
            assert_eq!(top["identity"], whale.identity().to_base58());
            assert_eq!(top["stake"], 5_000 * TOKEN);
            assert_eq!(top["gossip"]["protocol"], "UDP");
            assert_eq!(top["gossip"]["address"], "10.1.1.5:8001");
            assert_eq!(top["gossip"]["max_mbps"], 50);
            assert_eq!(top["gossip"]["staked_only"], false);
            assert_eq!(top["turbine"]["max_mbps"], 200);
            assert_eq!(top["turbine"]["staked_only"], true);
            assert_eq!(top["serve_repair"]["address"], "10.1.1.5:8003");
            assert_eq!(top["tpu_quic"]["protocol"], "QUIC");
            assert_eq!(top["tpu_quic"]["address"], "10.1.1.6:8009");
            assert_eq!(top["tpu_vote"]["max_mbps"], 10);
            assert_eq!(top["tpu_vote"]["staked_only"], true);
            assert_eq!(top["tpu_vote_quic"]["protocol"], "QUIC");
            assert_eq!(top["alpenglow"]["address"], "10.1.1.5:8006");
            assert!(top["tpu_forwards_quic"].is_null());

            // Ports a node does not advertise are null, not invented.
            let bottom = &entries[1];
            assert_eq!(bottom["identity"], minnow.identity().to_base58());
            assert!(bottom["turbine"].is_null());
            assert!(bottom["serve_repair"].is_null());
        }
    }

    #[tokio::test]
    async fn health_tracks_gossip_silence() {
        let f = fixture();
        let (status, body) = get(&f.router, "/v1/health").await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert!(health.stake_age_ms.is_none());

        f.clock.advance(11_000);
        let (status, body) = get(&f.router, "/v1/health").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert!(!health.healthy);
        assert_eq!(health.gossip_age_ms, 11_000);
    }

    #[tokio::test]
    async fn metrics_are_sampled_on_scrape() {
        let f = fixture();
        let a = add_peer(&f.state, [10, 0, 1, 1], 1);
        add_peer(&f.state, [10, 0, 2, 1], 3);
        set_stakes(&f.state, &[(&a, 1)]);

        let (status, body) = get(&f.router, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("stakescope_ranked_nodes 1"));
        assert!(text.contains("stakescope_foreign_nodes 1"));
        assert!(text.contains("stakescope_stake_epoch 7"));
    }

    #[tokio::test]
    async fn status_reports_identity_and_canonical() {
        let f = fixture();
        let (status, body) = get(&f.router, "/v1/status").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["identity"], f.state.gossip.identity().to_base58());
        assert_eq!(json["canonical_shred_version"], 1);
        assert_eq!(json["directory_entries"], 2);
    }

    #[test]
    fn aggregates_into_distinct_24s() {
        let mut addrs = vec![
            Ipv4Addr::new(192, 168, 1, 7),
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(192, 168, 1, 200),
        ];
        aggregate_into_24s(&mut addrs);
        assert_eq!(
            addrs,
            vec![Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(192, 168, 1, 0)]
        );
    }
}
