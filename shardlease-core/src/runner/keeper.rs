//! Runner lease keeper
//!
//! Keeps a runner's liveness lease and its shard leases alive. Any shard
//! whose refresh is not granted is dropped immediately: the lease may
//! already belong to another runner. If the store cannot be reached for a
//! whole TTL, every shard is dropped for the same reason.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::state::{RunnerPhase, RunnerState};
use crate::coordinator::state::ShardId;
use crate::error::{Result, ShardLeaseError};
use crate::runtime::retry::with_timeout;
use crate::runtime::ShutdownSignal;
use crate::storage::LeaseStore;

/// Configuration for the lease keeper
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// How often leases are refreshed
    pub refresh_interval: Duration,
    /// Lease TTL used by the store
    pub lease_ttl: Duration,
    /// Bound on each store call
    pub call_timeout: Duration,
}

impl Default for KeeperConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(crate::DEFAULT_REFRESH_INTERVAL_SECS),
            lease_ttl: Duration::from_secs(crate::DEFAULT_LEASE_TTL_SECS),
            call_timeout: Duration::from_secs(5),
        }
    }
}

impl KeeperConfig {
    /// Refresh must happen strictly within the TTL
    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval >= self.lease_ttl {
            return Err(ShardLeaseError::InvalidConfig {
                reason: format!(
                    "refresh interval {:?} must be shorter than lease ttl {:?}",
                    self.refresh_interval, self.lease_ttl
                ),
            });
        }
        Ok(())
    }
}

/// Refreshes a runner's leases on a timer
pub struct LeaseKeeper {
    config: KeeperConfig,
    store: Arc<dyn LeaseStore>,
    state: Arc<RunnerState>,
    /// Last time every served lease was confirmed
    last_confirmed: parking_lot::Mutex<Instant>,
}

impl LeaseKeeper {
    /// Create a new keeper
    pub fn new(config: KeeperConfig, store: Arc<dyn LeaseStore>, state: Arc<RunnerState>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            state,
            last_confirmed: parking_lot::Mutex::new(Instant::now()),
        })
    }

    /// Register with the directory
    pub async fn register(&self) -> Result<()> {
        if matches!(self.state.phase().await, RunnerPhase::Draining | RunnerPhase::Stopped) {
            return Err(ShardLeaseError::ShutdownInProgress);
        }
        let runner = self.state.runner().clone();
        with_timeout("register", self.config.call_timeout, self.store.register(&runner)).await?;
        self.state.set_phase(RunnerPhase::Registered).await;
        info!("Registered runner {} (version {})", runner.address, runner.version);
        Ok(())
    }

    /// One heartbeat + refresh round; returns the shards dropped
    pub async fn refresh_once(&self) -> Result<Vec<ShardId>> {
        match self.try_refresh().await {
            Ok(lost) => {
                *self.last_confirmed.lock() = Instant::now();
                Ok(lost)
            }
            Err(e) => {
                let since = self.last_confirmed.lock().elapsed();
                if since >= self.config.lease_ttl {
                    let dropped = self.state.clear().await;
                    if !dropped.is_empty() {
                        warn!(
                            "Leases unconfirmed for {:?}, stopped serving {:?}",
                            since, dropped
                        );
                    }
                }
                Err(e)
            }
        }
    }

    async fn try_refresh(&self) -> Result<Vec<ShardId>> {
        let address = self.state.runner().address.clone();
        let timeout = self.config.call_timeout;

        let known = with_timeout("heartbeat", timeout, self.store.heartbeat(&address)).await?;
        if !known {
            warn!("Runner {} missing from directory, re-registering", address);
            self.register().await?;
        }

        let served = self.state.served().await;
        if served.is_empty() {
            return Ok(Vec::new());
        }

        let granted = with_timeout("refresh", timeout, self.store.refresh(&address, &served)).await?;
        let lost = self.state.retain(&granted).await;
        if !lost.is_empty() {
            warn!("Runner {} lost leases on shards {:?}", address, lost);
        } else {
            debug!("Refreshed {} leases for {}", granted.len(), address);
        }
        Ok(lost)
    }

    /// Refresh until shutdown, then release every lease
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut ticker = interval(self.config.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_once().await {
                        warn!("Lease refresh failed: {}", e);
                    }
                }
                _ = shutdown.wait() => break,
            }
        }

        self.drain().await;
    }

    /// Stop serving and give up all leases
    pub async fn drain(&self) {
        self.state.set_phase(RunnerPhase::Draining).await;
        let served = self.state.clear().await;
        let address = self.state.runner().address.clone();

        match with_timeout("release_all", self.config.call_timeout, self.store.release_all(&address)).await {
            Ok(()) => info!("Runner {} released {} shards", address, served.len()),
            Err(e) => warn!("Runner {} release failed, leases will expire: {}", address, e),
        }
        self.state.set_phase(RunnerPhase::Stopped).await;
    }
}
