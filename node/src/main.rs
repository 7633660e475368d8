// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # stakescope Node
//!
//! Entry point for the `stakescope-node` binary. Parses CLI arguments,
//! initializes logging and metrics, joins the cluster's gossip as a spy,
//! polls stake from the operator's RPC endpoint, and serves the ranking
//! over HTTP.
//!
//! The binary supports three subcommands:
//!
//! - `run`    : join gossip and serve the ranking
//! - `keygen` : write a node identity key file
//! - `version`: print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use stakescope::clock::{Clock, SystemClock};
use stakescope::config::SOFTWARE_VERSION;
use stakescope::crypto::NodeKeypair;
use stakescope::gossip::{
    ContactDirectory, ContactInfo, GossipConfig, GossipNode, GossipService, SoftwareVersion,
    StartupError,
};
use stakescope::stake::{
    RpcConfig, RpcStakeSource, SnapshotCell, StakeFetcher, StakeFetcherConfig,
};
use stakescope::{RankingConfig, ShredVersionFilter};

use cli::{Commands, StakescopeCli};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = StakescopeCli::parse();

    match cli.command {
        Commands::Run(args) => run_node(*args).await,
        Commands::Keygen(args) => keygen(args),
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Starts the gossip spy, the stake fetcher and the HTTP API, and runs until
/// SIGINT or SIGTERM.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    logging::init_logging(&args.log_level, args.log_format);

    // --- Identity ---
    let keypair = match &args.identity {
        Some(path) => NodeKeypair::read_from_file(path)
            .map_err(StartupError::from)
            .with_context(|| format!("failed to load identity from {}", path.display()))?,
        None => {
            tracing::info!("no identity file given, using an ephemeral key");
            NodeKeypair::generate()
        }
    };
    let keypair = Arc::new(keypair);
    tracing::info!(
        identity = %keypair.identity(),
        gossip_bind = %args.gossip_bind,
        api_listen = %args.api_listen,
        rpc_url = %args.rpc_url,
        "starting stakescope-node"
    );

    // --- Entrypoints ---
    let entrypoints = resolve_entrypoints(&args.entrypoints).await?;

    // --- Gossip ---
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let now = clock.now_ms();
    let advertised = advertised_addr(args.gossip_bind, args.advertise_ip, &entrypoints).await?;
    tracing::info!(advertised = %advertised, "advertising gossip address");
    let mut self_info = ContactInfo::new(keypair.identity(), advertised, now);
    let (major, minor, patch) = SOFTWARE_VERSION;
    self_info.version = SoftwareVersion {
        major,
        minor,
        patch,
        commit: None,
    };
    let shred_filter = Arc::new(ShredVersionFilter::new(args.shred_policy, args.shred_version));
    let gossip = Arc::new(GossipNode::new(
        GossipConfig::default(),
        Arc::clone(&keypair),
        self_info,
        entrypoints,
        Arc::new(ContactDirectory::default()),
        Arc::clone(&shred_filter),
        now,
        &mut StdRng::from_entropy(),
    ));

    let cancel = CancellationToken::new();
    let gossip_service = GossipService::start(
        Arc::clone(&gossip),
        args.gossip_bind,
        Arc::clone(&clock),
        cancel.child_token(),
    )
    .await
    .context("failed to start gossip")?;

    // --- Stake ---
    let stakes = Arc::new(SnapshotCell::new());
    let source = RpcStakeSource::new(RpcConfig {
        url: args.rpc_url.clone(),
        api_key: args.rpc_api_key.clone(),
        include_delinquent: args.include_delinquent,
        timeout: stakescope::config::STAKE_RPC_TIMEOUT,
    })
    .context("failed to build stake RPC client")?;
    let fetcher = Arc::new(StakeFetcher::new(
        StakeFetcherConfig {
            refresh_interval: Duration::from_secs(args.stake_refresh_secs.max(1)),
        },
        Arc::new(source),
        Arc::clone(&stakes),
        Arc::clone(&clock),
    ));
    let fetch_loop = tokio::spawn(Arc::clone(&fetcher).run(cancel.child_token()));

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);

    // --- Application state ---
    let app_state = api::AppState {
        gossip: Arc::clone(&gossip),
        stakes,
        fetcher,
        ranking: RankingConfig {
            unreachable: args.unreachable,
            require_verified: args.require_verified,
            exclude: Some(keypair.identity()),
            ..RankingConfig::default()
        },
        clock,
        metrics: node_metrics,
        health_window: Duration::from_secs(args.health_window_secs),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_listener = tokio::net::TcpListener::bind(args.api_listen)
        .await
        .with_context(|| format!("failed to bind API listener on {}", args.api_listen))?;
    tracing::info!("API server listening on {}", args.api_listen);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    gossip_service.shutdown().await;
    if let Err(e) = fetch_loop.await {
        tracing::warn!("stake fetcher ended abnormally: {}", e);
    }
    tracing::info!("stakescope-node stopped");
    Ok(())
}

/// Resolves `host:port` entrypoints, preferring IPv4. Unresolvable entries
/// are skipped with a warning; having none left is fatal.
async fn resolve_entrypoints(entrypoints: &[String]) -> Result<Vec<SocketAddr>> {
    let mut resolved = Vec::with_capacity(entrypoints.len());
    for entry in entrypoints {
        match tokio::net::lookup_host(entry.as_str()).await {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                let Some(addr) = addrs
                    .iter()
                    .find(|a| a.is_ipv4())
                    .or_else(|| addrs.first())
                    .copied()
                else {
                    tracing::warn!(entrypoint = %entry, "entrypoint resolved to no address");
                    continue;
                };
                tracing::info!(entrypoint = %entry, addr = %addr, "entrypoint resolved");
                if !resolved.contains(&addr) {
                    resolved.push(addr);
                }
            }
            Err(e) => tracing::warn!(entrypoint = %entry, error = %e, "cannot resolve entrypoint"),
        }
    }
    if resolved.is_empty() {
        bail!("none of the {} entrypoints could be resolved", entrypoints.len());
    }
    Ok(resolved)
}

/// Picks the gossip address put in our contact record.
///
/// An explicit `--advertise-ip` wins, then a specific bind IP. A wildcard
/// bind falls back to the local interface that routes to the first
/// entrypoint. Peers drop records carrying an unspecified IP, so ending up
/// with one is fatal.
async fn advertised_addr(
    bind: SocketAddr,
    advertise_ip: Option<IpAddr>,
    entrypoints: &[SocketAddr],
) -> Result<SocketAddr> {
    let ip = match advertise_ip {
        Some(ip) => ip,
        None if !bind.ip().is_unspecified() => bind.ip(),
        None => match entrypoints.first() {
            Some(entrypoint) => route_source_ip(*entrypoint)
                .await
                .with_context(|| format!("cannot find a local route to {entrypoint}"))?,
            None => bail!("gossip bind {bind} is a wildcard and no entrypoint is known"),
        },
    };
    if ip.is_unspecified() || ip.is_multicast() {
        bail!("cannot advertise {ip} to peers: set --advertise-ip to this node's public IP");
    }
    Ok(SocketAddr::new(ip, bind.port()))
}

/// The source IP the OS would use to reach `target`. Connecting a UDP socket
/// sends nothing.
async fn route_source_ip(target: SocketAddr) -> Result<IpAddr> {
    let wildcard: IpAddr = match target {
        SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
    };
    let socket = tokio::net::UdpSocket::bind(SocketAddr::new(wildcard, 0)).await?;
    socket.connect(target).await?;
    Ok(socket.local_addr()?.ip())
}

/// Writes a fresh identity key file.
fn keygen(args: cli::KeygenArgs) -> Result<()> {
    let path = &args.output;
    if path.exists() && !args.force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    let keypair = NodeKeypair::generate();
    std::fs::write(path, keypair.secret_hex())
        .with_context(|| format!("failed to write identity key to {}", path.display()))?;

    // Restrict permissions on Unix.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }

    println!("Identity key written.");
    println!("  Key file : {}", path.display());
    println!("  Identity : {}", keypair.identity());
    Ok(())
}

/// Prints version information to stdout.
fn print_version() {
    let (major, minor, patch) = SOFTWARE_VERSION;
    println!("stakescope-node {}", env!("CARGO_PKG_VERSION"));
    println!("advertised      {major}.{minor}.{patch}");
    println!("rustc           {}", rustc_version());
}

/// Returns the Rust compiler version used to build this binary.
fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn entrypoints_resolve_and_dedupe() {
        let resolved = resolve_entrypoints(&[
            "127.0.0.1:8001".to_string(),
            "127.0.0.1:8001".to_string(),
            "127.0.0.1:8002".to_string(),
        ])
        .await
        .unwrap();
        assert_eq!(resolved.len(), 2);
    }

    #[tokio::test]
    async fn no_resolvable_entrypoint_is_fatal() {
        assert!(resolve_entrypoints(&["not an address".to_string()]).await.is_err());
    }

    #[tokio::test]
    async fn wildcard_bind_advertises_the_route_to_the_entrypoint() {
        let bind: SocketAddr = "0.0.0.0:8001".parse().unwrap();
        let entrypoint: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let advertised = advertised_addr(bind, None, &[entrypoint]).await.unwrap();
        assert_eq!(advertised, "127.0.0.1:8001".parse::<SocketAddr>().unwrap());
        assert!(!advertised.ip().is_unspecified());
    }

    #[tokio::test]
    async fn explicit_and_specific_addresses_win() {
        let entrypoint: SocketAddr = "127.0.0.1:8001".parse().unwrap();
        let wildcard: SocketAddr = "0.0.0.0:8001".parse().unwrap();
        let public: IpAddr = "203.0.113.7".parse().unwrap();
        assert_eq!(
            advertised_addr(wildcard, Some(public), &[entrypoint]).await.unwrap(),
            SocketAddr::new(public, 8001)
        );
        let specific: SocketAddr = "10.1.2.3:8002".parse().unwrap();
        assert_eq!(
            advertised_addr(specific, None, &[entrypoint]).await.unwrap(),
            specific
        );
    }

    #[tokio::test]
    async fn unusable_advertised_ip_is_fatal() {
        let wildcard: SocketAddr = "0.0.0.0:8001".parse().unwrap();
        assert!(advertised_addr(wildcard, None, &[]).await.is_err());
        assert!(
            advertised_addr(wildcard, Some(Ipv4Addr::UNSPECIFIED.into()), &[])
                .await
                .is_err()
        );
    }

    #[test]
    fn keygen_writes_a_loadable_key_and_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity.key");
        let args = || cli::KeygenArgs {
            output: path.clone(),
            force: false,
        };

        keygen(args()).unwrap();
        let loaded = NodeKeypair::read_from_file(&path).unwrap();
        assert!(keygen(args()).is_err());

        keygen(cli::KeygenArgs {
            output: path.clone(),
            force: true,
        })
        .unwrap();
        let replaced = NodeKeypair::read_from_file(&path).unwrap();
        assert_ne!(loaded.identity(), replaced.identity());
    }
}
