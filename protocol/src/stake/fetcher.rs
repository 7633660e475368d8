//! # Stake Fetcher
//!
//! Periodically asks a [`StakeSource`] for the stake distribution and
//! publishes each successful answer as a new [`StakeSnapshot`]. A failed
//! fetch is logged and counted and changes nothing else: ranking keeps using
//! the last good snapshot rather than falling back to zero stake.
//!
//! The fetcher runs on its own timer and shares nothing with gossip except
//! the [`SnapshotCell`] readers pull from.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::rpc::{FetchError, StakeSource};
use super::snapshot::{SnapshotCell, StakeSnapshot};
use crate::clock::Clock;
use crate::config::STAKE_REFRESH_INTERVAL;

#[derive(Debug, Clone)]
pub struct StakeFetcherConfig {
    pub refresh_interval: Duration,
}

impl Default for StakeFetcherConfig {
    fn default() -> Self {
        Self {
            refresh_interval: STAKE_REFRESH_INTERVAL,
        }
    }
}

/// Outcome counters of the fetch loop.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FetchStatus {
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
    pub last_success_ms: Option<u64>,
    pub last_error: Option<String>,
}

pub struct StakeFetcher {
    config: StakeFetcherConfig,
    source: Arc<dyn StakeSource>,
    cell: Arc<SnapshotCell>,
    clock: Arc<dyn Clock>,
    status: Mutex<FetchStatus>,
}

impl StakeFetcher {
    pub fn new(
        config: StakeFetcherConfig,
        source: Arc<dyn StakeSource>,
        cell: Arc<SnapshotCell>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            source,
            cell,
            clock,
            status: Mutex::new(FetchStatus::default()),
        }
    }

    /// The cell snapshots are published to.
    pub fn cell(&self) -> &Arc<SnapshotCell> {
        &self.cell
    }

    pub fn status(&self) -> FetchStatus {
        self.status.lock().clone()
    }

    /// Fetches once. On success the new snapshot replaces the old one; on
    /// failure the old one stays and the error is returned for the caller
    /// to surface.
    pub async fn refresh(&self) -> Result<Arc<StakeSnapshot>, FetchError> {
        match self.source.fetch().await {
            Ok(dist) => {
                let now = self.clock.now_ms();
                let snapshot = StakeSnapshot::new(dist.epoch, now, dist.stakes);
                let nodes = snapshot.len();
                let total = snapshot.total_stake();
                let previous = self.cell.replace(snapshot);
                {
                    let mut status = self.status.lock();
                    status.successes += 1;
                    status.consecutive_failures = 0;
                    status.last_success_ms = Some(now);
                    status.last_error = None;
                }
                let epoch = dist.epoch;
                match previous {
                    Some(previous) if previous.epoch == epoch => {
                        debug!(epoch, nodes, total_stake = total, "stake refreshed")
                    }
                    _ => info!(epoch, nodes, total_stake = total, "stake snapshot updated"),
                }
                Ok(self.cell.current())
            }
            Err(err) => {
                let consecutive = {
                    let mut status = self.status.lock();
                    status.failures += 1;
                    status.consecutive_failures += 1;
                    status.last_error = Some(err.to_string());
                    status.consecutive_failures
                };
                warn!(
                    error = %err,
                    consecutive_failures = consecutive,
                    "stake fetch failed; keeping previous snapshot"
                );
                Err(err)
            }
        }
    }

    /// Fetches immediately and then every `refresh_interval` until
    /// `cancel` fires. Failures never end the loop.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stake fetcher shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    // Errors are already logged and counted.
                    let _ = self.refresh().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for StakeFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StakeFetcher")
            .field("config", &self.config)
            .field("status", &*self.status.lock())
            .finish()
    }
}
