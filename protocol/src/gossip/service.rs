//! # Gossip Service
//!
//! The async driver around [`GossipNode`]. It owns the UDP socket and the
//! round timers and does nothing but move bytes: every decision is made by
//! the node. Two tasks run per service:
//!
//! - **receiver**: `recv_from` -> [`GossipNode::handle_packet`] -> send replies
//! - **ticker**: pull, push and maintenance rounds on their own intervals
//!
//! Every `send_to` is bounded by the configured send timeout. A send that
//! times out or fails is abandoned and counted; the next round produces
//! fresh traffic anyway.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::{NetworkError, StartupError};
use super::node::{GossipNode, GossipStats, Outbound};
use crate::clock::Clock;
use crate::config::{PACKET_DATA_SIZE, RECV_ERROR_BACKOFF, RECV_ERROR_BACKOFF_MAX};

/// Binds the gossip UDP socket. Failure here is fatal to the process.
pub async fn bind_socket(addr: SocketAddr) -> Result<UdpSocket, StartupError> {
    UdpSocket::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { addr, source })
}

/// A running gossip service.
pub struct GossipService {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl GossipService {
    /// Binds `bind_addr` and starts gossiping.
    pub async fn start(
        node: Arc<GossipNode>,
        bind_addr: SocketAddr,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Result<Self, StartupError> {
        let socket = bind_socket(bind_addr).await?;
        Self::spawn(node, socket, clock, cancel)
    }

    /// Starts gossiping on an already bound socket.
    ///
    /// Sends the bootstrap pings and pull requests before returning, then
    /// runs until `cancel` fires.
    pub fn spawn(
        node: Arc<GossipNode>,
        socket: UdpSocket,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Result<Self, StartupError> {
        let local_addr = socket.local_addr().map_err(|source| StartupError::Bind {
            addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            source,
        })?;
        let socket = Arc::new(socket);
        info!(
            identity = %node.identity(),
            addr = %local_addr,
            entrypoints = node.entrypoints().len(),
            "gossip service listening"
        );

        let bootstrap = {
            let mut rng = StdRng::from_entropy();
            node.bootstrap(clock.now_ms(), &mut rng)
        };

        let receiver = tokio::spawn(receive_loop(
            node.clone(),
            socket.clone(),
            clock.clone(),
            cancel.child_token(),
        ));
        let ticker = tokio::spawn(tick_loop(
            node,
            socket,
            clock,
            bootstrap,
            cancel.child_token(),
        ));

        Ok(Self {
            local_addr,
            cancel,
            tasks: vec![receiver, ticker],
        })
    }

    /// The address the gossip socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops both tasks and waits for them to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(err) = task.await {
                warn!(error = %err, "gossip task ended abnormally");
            }
        }
        info!("gossip service stopped");
    }
}

impl Drop for GossipService {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl std::fmt::Debug for GossipService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipService")
            .field("local_addr", &self.local_addr)
            .field("running", &!self.cancel.is_cancelled())
            .finish()
    }
}

async fn receive_loop(
    node: Arc<GossipNode>,
    socket: Arc<UdpSocket>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) {
    let mut rng = StdRng::from_entropy();
    // One spare byte so oversized datagrams arrive oversized instead of
    // silently truncated to a valid length.
    let mut buf = vec![0u8; PACKET_DATA_SIZE + 1];
    let send_timeout = node.config().send_timeout;
    let mut failures = 0u32;
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("gossip receiver shutting down");
                break;
            }
            received = socket.recv_from(&mut buf) => received,
        };
        let (len, from) = match received {
            Ok(received) => {
                failures = 0;
                received
            }
            Err(err) => {
                failures = failures.saturating_add(1);
                let pause = recv_backoff(failures);
                if failures == 1 || pause == RECV_ERROR_BACKOFF_MAX {
                    warn!(error = %err, failures, "gossip recv failing, backing off");
                } else {
                    debug!(error = %err, failures, "gossip recv failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(pause) => continue,
                }
            }
        };
        let replies = node.handle_packet(from, &buf[..len], clock.now_ms(), &mut rng);
        send_all(&socket, replies, send_timeout, node.stats()).await;
    }
}

/// Pause before the next receive after `failures` consecutive errors.
fn recv_backoff(failures: u32) -> Duration {
    let shift = failures.saturating_sub(1).min(16);
    RECV_ERROR_BACKOFF
        .saturating_mul(1 << shift)
        .min(RECV_ERROR_BACKOFF_MAX)
}

async fn tick_loop(
    node: Arc<GossipNode>,
    socket: Arc<UdpSocket>,
    clock: Arc<dyn Clock>,
    bootstrap: Vec<Outbound>,
    cancel: CancellationToken,
) {
    let mut rng = StdRng::from_entropy();
    let config = node.config().clone();
    send_all(&socket, bootstrap, config.send_timeout, node.stats()).await;

    let mut pull = interval(config.pull_interval);
    let mut push = interval(config.push_interval);
    let mut maintenance = interval(config.maintenance_interval);
    for ticker in [&mut pull, &mut push, &mut maintenance] {
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    }
    // The first tick of a tokio interval fires immediately; bootstrap has
    // already covered it.
    pull.tick().await;

    loop {
        let out = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("gossip ticker shutting down");
                break;
            }
            _ = pull.tick() => node.pull_round(clock.now_ms(), &mut rng),
            _ = push.tick() => node.push_round(clock.now_ms(), &mut rng),
            _ = maintenance.tick() => node.maintenance(clock.now_ms(), &mut rng),
        };
        send_all(&socket, out, config.send_timeout, node.stats()).await;
    }
}

async fn send_all(
    socket: &UdpSocket,
    out: Vec<Outbound>,
    send_timeout: Duration,
    stats: &GossipStats,
) {
    for Outbound { addr, payload } in out {
        if let Err(err) = send_one(socket, addr, &payload, send_timeout).await {
            stats.send_failures.fetch_add(1, Ordering::Relaxed);
            debug!(error = %err, "gossip send abandoned");
        }
    }
}

async fn send_one(
    socket: &UdpSocket,
    addr: SocketAddr,
    payload: &[u8],
    send_timeout: Duration,
) -> Result<(), NetworkError> {
    match tokio::time::timeout(send_timeout, socket.send_to(payload, addr)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(source)) => Err(NetworkError::Io { addr, source }),
        Err(_) => Err(NetworkError::SendTimeout(addr)),
    }
}
