//! # CLI Interface
//!
//! Defines the command-line argument structure for `stakescope-node` using
//! `clap` derive. Supports three subcommands: `run`, `keygen`, and
//! `version`. Every `run` flag can also come from a `STAKESCOPE_*`
//! environment variable.
//!
//! The stake RPC endpoint and the gossip entrypoints have no defaults. The
//! operator decides whom to trust.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stakescope::config::{DEFAULT_API_PORT, DEFAULT_GOSSIP_PORT};
use stakescope::{ShredVersionPolicy, UnreachablePolicy};

use crate::logging::LogFormat;

/// Gossip spy serving a stake-ranked view of live cluster nodes.
#[derive(Parser, Debug)]
#[command(
    name = "stakescope-node",
    about = "Gossip spy serving a stake-ranked view of live cluster nodes",
    version,
    propagate_version = true
)]
pub struct StakescopeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Join the cluster's gossip and serve the ranking over HTTP.
    Run(Box<RunArgs>),
    /// Generate a node identity key file.
    Keygen(KeygenArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Gossip entrypoint, `host:port`. Repeat for several.
    #[arg(
        long = "entrypoint",
        short = 'e',
        env = "STAKESCOPE_ENTRYPOINTS",
        value_delimiter = ',',
        required = true
    )]
    pub entrypoints: Vec<String>,

    /// JSON-RPC endpoint stake is read from.
    #[arg(long, env = "STAKESCOPE_RPC_URL")]
    pub rpc_url: String,

    /// API key sent to the RPC endpoint in the `X-Api-Key` header.
    #[arg(long, env = "STAKESCOPE_RPC_API_KEY", hide_env_values = true)]
    pub rpc_api_key: Option<String>,

    /// Count stake of delinquent vote accounts too.
    #[arg(long, env = "STAKESCOPE_INCLUDE_DELINQUENT")]
    pub include_delinquent: bool,

    /// Seconds between stake fetches.
    #[arg(long, env = "STAKESCOPE_STAKE_REFRESH_SECS", default_value_t = 60)]
    pub stake_refresh_secs: u64,

    /// Address the gossip UDP socket binds to.
    #[arg(
        long,
        env = "STAKESCOPE_GOSSIP_BIND",
        default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_GOSSIP_PORT))
    )]
    pub gossip_bind: SocketAddr,

    /// Public IP advertised in our contact record. Defaults to the bind IP,
    /// or to the local interface routing to the first entrypoint when the
    /// bind IP is a wildcard.
    #[arg(long, env = "STAKESCOPE_ADVERTISE_IP")]
    pub advertise_ip: Option<IpAddr>,

    /// Address the HTTP API listens on.
    #[arg(
        long,
        env = "STAKESCOPE_API_LISTEN",
        default_value_t = SocketAddr::from(([127, 0, 0, 1], DEFAULT_API_PORT))
    )]
    pub api_listen: SocketAddr,

    /// Expected shred version of the cluster.
    #[arg(long, env = "STAKESCOPE_SHRED_VERSION")]
    pub shred_version: Option<u16>,

    /// How `--shred-version` and the entrypoint's advertised value combine:
    /// prefer-override, prefer-observed, override-only or observed-only.
    #[arg(long, env = "STAKESCOPE_SHRED_POLICY", default_value = "prefer-override")]
    pub shred_policy: ShredVersionPolicy,

    /// Staked nodes not seen in gossip: exclude or include-marked.
    #[arg(long, env = "STAKESCOPE_UNREACHABLE", default_value = "exclude")]
    pub unreachable: UnreachablePolicy,

    /// Only rank nodes whose gossip address answered a ping.
    #[arg(long, env = "STAKESCOPE_REQUIRE_VERIFIED")]
    pub require_verified: bool,

    /// Identity key file written by `keygen`. A fresh key is generated for
    /// this run when omitted.
    #[arg(long, short = 'i', env = "STAKESCOPE_IDENTITY")]
    pub identity: Option<PathBuf>,

    /// `/v1/health` fails once no valid gossip packet arrived for this many
    /// seconds.
    #[arg(long, env = "STAKESCOPE_HEALTH_WINDOW_SECS", default_value_t = 10)]
    pub health_window_secs: u64,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, env = "STAKESCOPE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "STAKESCOPE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

/// Arguments for the `keygen` subcommand.
#[derive(Parser, Debug)]
pub struct KeygenArgs {
    /// Where to write the key file.
    #[arg(long, short = 'o')]
    pub output: PathBuf,

    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,
}
