//! # Stake RPC Client
//!
//! Retrieves the stake distribution from an operator-configured JSON-RPC 2.0
//! endpoint. Two calls make one fetch:
//!
//! | Method            | Used for                                   |
//! |-------------------|--------------------------------------------|
//! | `getEpochInfo`    | the epoch the distribution belongs to      |
//! | `getVoteAccounts` | `activatedStake` per vote account          |
//!
//! A node may run several vote accounts; their stakes are summed under the
//! account's `nodePubkey`.
//!
//! There is no default endpoint. Stake data comes only from a source the
//! operator chose to trust.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::STAKE_RPC_TIMEOUT;
use crate::crypto::NodeIdentity;

/// Header carrying the optional API key.
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// Longest error body kept in a [`FetchError::Status`].
const MAX_ERROR_BODY: usize = 256;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A stake fetch that did not produce a distribution. Never fatal: the
/// previous snapshot stays in force.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("stake rpc timed out after {0:?}")]
    Timeout(Duration),

    #[error("stake rpc unreachable: {0}")]
    Transport(#[source] reqwest::Error),

    #[error("stake rpc returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("stake rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed stake rpc response: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Source abstraction
// ---------------------------------------------------------------------------

/// Stake per node identity for one epoch, as reported by a source.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StakeDistribution {
    pub epoch: u64,
    pub stakes: HashMap<NodeIdentity, u64>,
}

/// Anything that can report the current stake distribution.
#[async_trait]
pub trait StakeSource: Send + Sync {
    async fn fetch(&self) -> Result<StakeDistribution, FetchError>;
}

// ---------------------------------------------------------------------------
// JSON-RPC wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RpcRequest {
    jsonrpc: &'static str,
    id: u64,
    method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct EpochInfo {
    epoch: u64,
}

#[derive(Debug, Deserialize)]
struct VoteAccounts {
    current: Vec<VoteAccount>,
    #[serde(default)]
    delinquent: Vec<VoteAccount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VoteAccount {
    node_pubkey: String,
    activated_stake: u64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Connection settings for [`RpcStakeSource`].
#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub url: String,
    pub api_key: Option<String>,
    /// Count stake of delinquent vote accounts too.
    pub include_delinquent: bool,
    pub timeout: Duration,
}

impl RpcConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: None,
            include_delinquent: false,
            timeout: STAKE_RPC_TIMEOUT,
        }
    }
}

/// [`StakeSource`] backed by a JSON-RPC endpoint.
#[derive(Debug)]
pub struct RpcStakeSource {
    config: RpcConfig,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl RpcStakeSource {
    pub fn new(config: RpcConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(FetchError::Transport)?;
        Ok(Self {
            config,
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<T, FetchError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let mut builder = self.client.post(&self.config.url).json(&request);
        if let Some(key) = &self.config.api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut end = MAX_ERROR_BODY;
                while !body.is_char_boundary(end) {
                    end -= 1;
                }
                body.truncate(end);
            }
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: RpcResponse<T> = response.json().await.map_err(|e| self.classify(e))?;
        match (body.result, body.error) {
            (_, Some(err)) => Err(FetchError::Rpc {
                code: err.code,
                message: err.message,
            }),
            (Some(result), None) => Ok(result),
            (None, None) => Err(FetchError::Malformed(format!(
                "{method}: neither result nor error"
            ))),
        }
    }

    fn classify(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.config.timeout)
        } else if err.is_decode() {
            FetchError::Malformed(err.to_string())
        } else {
            FetchError::Transport(err)
        }
    }
}

#[async_trait]
impl StakeSource for RpcStakeSource {
    async fn fetch(&self) -> Result<StakeDistribution, FetchError> {
        let epoch: EpochInfo = self.call("getEpochInfo", None).await?;
        let accounts: VoteAccounts = self.call("getVoteAccounts", None).await?;

        let mut delinquent = accounts.delinquent;
        let mut all = accounts.current;
        if self.config.include_delinquent {
            all.append(&mut delinquent);
        }
        Ok(StakeDistribution {
            epoch: epoch.epoch,
            stakes: sum_by_node(all),
        })
    }
}

/// Sums activated stake per node. Accounts naming an unparseable node key
/// are skipped.
fn sum_by_node(accounts: Vec<VoteAccount>) -> HashMap<NodeIdentity, u64> {
    let mut stakes: HashMap<NodeIdentity, u64> = HashMap::new();
    for account in accounts {
        match account.node_pubkey.parse::<NodeIdentity>() {
            Ok(identity) => {
                let total = stakes.entry(identity).or_default();
                *total = total.saturating_add(account.activated_stake);
            }
            Err(err) => {
                debug!(node_pubkey = %account.node_pubkey, error = %err, "skipping vote account")
            }
        }
    }
    stakes
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::net::SocketAddr;

    /// Serves a canned JSON-RPC backend on an ephemeral port.
    pub(crate) async fn mock_rpc(router: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        addr
    }

    pub(crate) fn cluster_rpc(epoch: u64, current: Value, delinquent: Value) -> Router {
        Router::new().route(
            "/",
            post(move |Json(request): Json<Value>| {
                let current = current.clone();
                let delinquent = delinquent.clone();
                async move {
                    let result = match request["method"].as_str() {
                        Some("getEpochInfo") => json!({ "epoch": epoch, "slotIndex": 5 }),
                        Some("getVoteAccounts") => {
                            json!({ "current": current, "delinquent": delinquent })
                        }
                        _ => {
                            return Json(json!({
                                "jsonrpc": "2.0",
                                "id": request["id"],
                                "error": { "code": -32601, "message": "Method not found" }
                            }))
                        }
                    };
                    Json(json!({ "jsonrpc": "2.0", "id": request["id"], "result": result }))
                }
            }),
        )
    }

    pub(crate) fn vote(node: &NodeIdentity, stake: u64) -> Value {
        json!({
            "votePubkey": NodeIdentity::new([0xee; 32]).to_base58(),
            "nodePubkey": node.to_base58(),
            "activatedStake": stake,
            "commission": 10,
        })
    }

    fn source(addr: SocketAddr) -> RpcStakeSource {
        RpcStakeSource::new(RpcConfig::new(format!("http://{addr}/"))).unwrap()
    }

    #[tokio::test]
    async fn sums_stake_per_node() {
        let a = NodeIdentity::new([1; 32]);
        let b = NodeIdentity::new([2; 32]);
        let c = NodeIdentity::new([3; 32]);
        let addr = mock_rpc(cluster_rpc(
            42,
            json!([vote(&a, 100), vote(&a, 20), vote(&b, 50)]),
            json!([vote(&c, 70)]),
        ))
        .await;

        let dist = source(addr).fetch().await.unwrap();
        assert_eq!(dist.epoch, 42);
        assert_eq!(dist.stakes.get(&a), Some(&120));
        assert_eq!(dist.stakes.get(&b), Some(&50));
        assert_eq!(dist.stakes.get(&c), None);
    }

    #[tokio::test]
    async fn delinquent_stake_is_opt_in() {
        let c = NodeIdentity::new([3; 32]);
        let addr = mock_rpc(cluster_rpc(1, json!([]), json!([vote(&c, 70)]))).await;
        let mut config = RpcConfig::new(format!("http://{addr}/"));
        config.include_delinquent = true;

        let dist = RpcStakeSource::new(config).unwrap().fetch().await.unwrap();
        assert_eq!(dist.stakes.get(&c), Some(&70));
    }

    #[tokio::test]
    async fn invalid_node_keys_are_skipped() {
        let a = NodeIdentity::new([1; 32]);
        let bogus = json!({ "nodePubkey": "not-a-key", "activatedStake": 5 });
        let addr = mock_rpc(cluster_rpc(1, json!([vote(&a, 9), bogus]), json!([]))).await;

        let dist = source(addr).fetch().await.unwrap();
        assert_eq!(dist.stakes.len(), 1);
    }

    #[tokio::test]
    async fn api_key_header_is_sent() {
        let router = Router::new().route(
            "/",
            post(|headers: HeaderMap, Json(request): Json<Value>| async move {
                if headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) != Some("s3cret") {
                    return Err(StatusCode::UNAUTHORIZED);
                }
                let result = match request["method"].as_str() {
                    Some("getEpochInfo") => json!({ "epoch": 7 }),
                    _ => json!({ "current": [], "delinquent": [] }),
                };
                Ok(Json(json!({ "jsonrpc": "2.0", "id": request["id"], "result": result })))
            }),
        );
        let addr = mock_rpc(router).await;

        let err = source(addr).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 401, .. }));

        let mut config = RpcConfig::new(format!("http://{addr}/"));
        config.api_key = Some("s3cret".into());
        let dist = RpcStakeSource::new(config).unwrap().fetch().await.unwrap();
        assert_eq!(dist.epoch, 7);
    }

    #[tokio::test]
    async fn rpc_error_object_is_reported() {
        let router = Router::new().route(
            "/",
            post(|| async {
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "error": { "code": -32005, "message": "Node is behind" }
                }))
            }),
        );
        let addr = mock_rpc(router).await;
        let err = source(addr).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Rpc { code: -32005, .. }));
    }

    #[tokio::test]
    async fn malformed_body_is_reported() {
        let router = Router::new().route("/", post(|| async { "definitely not json" }));
        let addr = mock_rpc(router).await;
        let err = source(addr).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Malformed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn slow_endpoint_times_out() {
        let router = Router::new().route(
            "/",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({}))
            }),
        );
        let addr = mock_rpc(router).await;
        let mut config = RpcConfig::new(format!("http://{addr}/"));
        config.timeout = Duration::from_millis(100);

        let err = RpcStakeSource::new(config).unwrap().fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Timeout(_)), "{err:?}");
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_transport_error() {
        // Bind and drop to get a port nothing listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let err = source(addr).fetch().await.unwrap_err();
        assert!(matches!(err, FetchError::Transport(_)), "{err:?}");
    }
}
