//! Coordinator loop
//!
//! A single active coordinator reconciles its view against the lease store
//! on a timer. Each tick:
//!
//! 1. Reconcile: read the store, drop runners whose liveness lease lapsed,
//!    rebuild shard ownership from live shard leases.
//! 2. Assign: place unowned shards, committing only granted acquires.
//! 3. Rebalance: stop + release on the source, and only after the release
//!    is confirmed acquire on the destination.
//! 4. Persist: save assignments and the live runner directory.

use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::events::{CoordinatorEvent, EventBus};
use super::membership::MembershipManager;
use super::planner::{
    decide_assignments_for_unassigned_shards, decide_assignments_for_unbalanced_shards,
};
use super::state::{CoordinatorState, Runner, RunnerAddress, ShardId};
use crate::error::{Result, ShardLeaseError};
use crate::metrics::standard;
use crate::runner::RunnerNotifier;
use crate::runtime::retry::{with_timeout, RetryPolicy};
use crate::runtime::ShutdownSignal;
use crate::storage::{Clock, LeaseStore};

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Size of the shard universe, fixed for the lifetime of the cluster
    pub shard_count: u32,
    /// Tolerated shard-count difference between compatible runners
    pub rebalance_threshold: u32,
    /// Lease TTL the store applies
    pub lease_ttl: Duration,
    /// How often runners refresh their leases
    pub refresh_interval: Duration,
    /// Reconciliation period
    pub tick_interval: Duration,
    /// Bound on each store or runner call
    pub call_timeout: Duration,
    /// Cap on rebalance moves per tick
    pub max_moves_per_tick: Option<usize>,
    /// Retry policy for persisting state
    pub persist_retry: RetryPolicy,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            shard_count: 300,
            rebalance_threshold: crate::DEFAULT_REBALANCE_THRESHOLD,
            lease_ttl: Duration::from_secs(crate::DEFAULT_LEASE_TTL_SECS),
            refresh_interval: Duration::from_secs(crate::DEFAULT_REFRESH_INTERVAL_SECS),
            tick_interval: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            max_moves_per_tick: None,
            persist_retry: RetryPolicy::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Reject configurations that break lease safety
    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 {
            return Err(ShardLeaseError::InvalidConfig {
                reason: "shard_count must be at least 1".into(),
            });
        }
        if self.refresh_interval >= self.lease_ttl {
            return Err(ShardLeaseError::InvalidConfig {
                reason: format!(
                    "refresh interval {:?} must be shorter than lease ttl {:?}",
                    self.refresh_interval, self.lease_ttl
                ),
            });
        }
        if self.tick_interval.is_zero() || self.call_timeout.is_zero() {
            return Err(ShardLeaseError::InvalidConfig {
                reason: "tick interval and call timeout must be positive".into(),
            });
        }
        Ok(())
    }

    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            shard_count: env_or("SHARD_COUNT", defaults.shard_count)?,
            rebalance_threshold: env_or("REBALANCE_THRESHOLD", defaults.rebalance_threshold)?,
            lease_ttl: Duration::from_secs(env_or("LEASE_TTL_SECS", defaults.lease_ttl.as_secs())?),
            refresh_interval: Duration::from_secs(env_or(
                "REFRESH_INTERVAL_SECS",
                defaults.refresh_interval.as_secs(),
            )?),
            tick_interval: Duration::from_secs(env_or(
                "TICK_INTERVAL_SECS",
                defaults.tick_interval.as_secs(),
            )?),
            call_timeout: Duration::from_millis(env_or(
                "CALL_TIMEOUT_MS",
                defaults.call_timeout.as_millis() as u64,
            )?),
            max_moves_per_tick: match std::env::var("MAX_MOVES_PER_TICK") {
                Ok(raw) => Some(parse_env("MAX_MOVES_PER_TICK", &raw)?),
                Err(_) => None,
            },
            persist_retry: defaults.persist_retry,
        };
        config.validate()?;
        Ok(config)
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => parse_env(name, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_env<T: FromStr>(name: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ShardLeaseError::InvalidConfig {
        reason: format!("{}={:?}: {}", name, raw, e),
    })
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub joined: Vec<RunnerAddress>,
    pub expired: Vec<RunnerAddress>,
    /// Live runners that came back with a new version
    pub upgraded: Vec<RunnerAddress>,
    /// Previously unowned shards now owned
    pub assigned: usize,
    /// Shards moved by rebalancing
    pub moved: usize,
    /// Shards whose release is still unconfirmed
    pub unconfirmed: usize,
    /// Notifications still waiting for acknowledgement
    pub pending_notifications: usize,
}

/// Read-only view for status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub runners: usize,
    pub assigned: usize,
    pub unassigned: usize,
    pub state: CoordinatorState,
}

/// State owned by the tick; never touched concurrently
struct LoopState {
    membership: MembershipManager,
    state: CoordinatorState,
    /// `notify_assign` calls not yet acknowledged
    pending_assigns: BTreeSet<(RunnerAddress, ShardId)>,
    /// Shards told to stop whose release is not confirmed, with their owner
    unconfirmed_releases: BTreeMap<ShardId, RunnerAddress>,
}

/// Main coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    store: Arc<dyn LeaseStore>,
    notifier: Arc<dyn RunnerNotifier>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    inner: Mutex<LoopState>,
    snapshot: parking_lot::RwLock<CoordinatorState>,
}

impl Coordinator {
    /// Create a new coordinator
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn LeaseStore>,
        notifier: Arc<dyn RunnerNotifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let state = CoordinatorState::new(config.shard_count);

        Ok(Self {
            inner: Mutex::new(LoopState {
                membership: MembershipManager::new(),
                state: state.clone(),
                pending_assigns: BTreeSet::new(),
                unconfirmed_releases: BTreeMap::new(),
            }),
            snapshot: parking_lot::RwLock::new(state),
            events: EventBus::default(),
            config,
            store,
            notifier,
            clock,
        })
    }

    /// Configuration in effect
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Subscribe to coordinator events
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the state as of the last tick
    pub fn state(&self) -> CoordinatorState {
        self.snapshot.read().clone()
    }

    /// Status summary as of the last tick
    pub fn status(&self) -> CoordinatorStatus {
        let state = self.state();
        CoordinatorStatus {
            runners: state.runners.len(),
            assigned: state.assigned_count(),
            unassigned: state.unassigned_shards().len(),
            state,
        }
    }

    /// Spawn the periodic tick loop
    pub fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        info!(
            "Coordinator starting: {} shards, tick every {:?}",
            self.config.shard_count, self.config.tick_interval
        );
        tokio::spawn(async move { self.run(shutdown).await })
    }

    /// Tick until shutdown
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Failures are logged inside; the next tick retries
                    let _ = self.tick().await;
                }
                _ = shutdown.wait() => {
                    info!("Coordinator loop stopping");
                    break;
                }
            }
        }
    }

    /// Run one reconciliation tick
    pub async fn tick(&self) -> Result<TickReport> {
        let started = Instant::now();
        let mut inner = self.inner.lock().await;

        let result = self.run_tick(&mut inner).await;
        match &result {
            Ok(report) => {
                let changed = report.assigned > 0
                    || report.moved > 0
                    || !report.joined.is_empty()
                    || !report.expired.is_empty()
                    || !report.upgraded.is_empty();
                if changed {
                    info!(
                        "Tick: +{} runners, -{} runners, {} upgraded, {} assigned, {} moved",
                        report.joined.len(),
                        report.expired.len(),
                        report.upgraded.len(),
                        report.assigned,
                        report.moved
                    );
                }
            }
            Err(e @ ShardLeaseError::InvariantViolation { .. }) => {
                standard::TICK_FAILURES.inc();
                error!("Coordinator invariant violated, tick discarded: {}", e);
            }
            Err(e) => {
                standard::TICK_FAILURES.inc();
                warn!("Tick aborted, retrying next interval: {}", e);
            }
        }

        *self.snapshot.write() = inner.state.clone();
        standard::REGISTERED_RUNNERS.set(inner.membership.live_count() as i64);
        standard::ASSIGNED_SHARDS.set(inner.state.assigned_count() as i64);
        standard::UNASSIGNED_SHARDS.set(inner.state.unassigned_shards().len() as i64);
        standard::TICK_DURATION.observe(started.elapsed());

        result
    }

    async fn run_tick(&self, inner: &mut LoopState) -> Result<TickReport> {
        let mut report = TickReport::default();

        self.retry_unconfirmed_releases(inner).await;
        self.reconcile(inner, &mut report).await?;
        self.flush_pending_assigns(inner).await;

        report.assigned = self.assign_unassigned(inner).await?;
        report.moved = self.rebalance(inner).await?;

        self.persist(inner).await?;

        report.unconfirmed = inner.unconfirmed_releases.len();
        report.pending_notifications = inner.pending_assigns.len();
        Ok(report)
    }

    /// Rebuild state from the store; storage failures abort the tick
    async fn reconcile(&self, inner: &mut LoopState, report: &mut TickReport) -> Result<()> {
        let timeout = self.config.call_timeout;
        let (stored, directory, expirations, owners) = futures::try_join!(
            with_timeout("get_assignments", timeout, self.store.get_assignments()),
            with_timeout("get_runners", timeout, self.store.get_runners()),
            with_timeout("runner_expirations", timeout, self.store.runner_expirations()),
            with_timeout("lease_owners", timeout, self.store.lease_owners()),
        )?;

        let now = self.clock.now();
        let change = inner.membership.reconcile(&directory, &expirations, now);
        if !change.is_empty() {
            debug!("Membership changed: {:?}", change);
        }

        if !change.expired.is_empty() {
            if let Err(e) = with_timeout(
                "remove_runners",
                timeout,
                self.store.remove_runners(&change.expired),
            )
            .await
            {
                warn!("Failed to remove expired runners {:?}: {}", change.expired, e);
            }
        }

        let shard_count = self.config.shard_count;
        for shard in stored.keys().chain(owners.keys()) {
            if *shard == 0 || *shard > shard_count {
                warn!("Ignoring stored shard {} outside [1, {}]", shard, shard_count);
            }
        }

        let mut state = CoordinatorState::new(shard_count);
        for registered in inner.membership.live().values() {
            state.register(registered.runner.clone(), registered.registered_at);
        }

        for shard in 1..=shard_count {
            let owner = owners
                .get(&shard)
                .filter(|address| inner.membership.is_live(address))
                .cloned();

            let recorded = stored.get(&shard).cloned().flatten();
            if let Some(address) = &owner {
                let releasing = inner.unconfirmed_releases.contains_key(&shard);
                if recorded.as_ref() != Some(address) && !releasing {
                    debug!("Shard {} leased by {} but recorded as {:?}", shard, address, recorded);
                    inner.pending_assigns.insert((address.clone(), shard));
                }
            }
            state.set_owner(shard, owner)?;
        }

        // Forget notifications and releases that no longer match ownership
        inner
            .pending_assigns
            .retain(|(address, shard)| state.owner(*shard) == Some(address));
        inner
            .unconfirmed_releases
            .retain(|shard, address| state.owner(*shard) == Some(&*address));

        state.check_invariants(shard_count)?;

        for address in &change.joined {
            self.events.publish(CoordinatorEvent::RunnerRegistered { address: address.clone() });
        }
        for address in &change.expired {
            self.events.publish(CoordinatorEvent::RunnerUnregistered { address: address.clone() });
        }

        report.joined = change.joined;
        report.expired = change.expired;
        report.upgraded = change.upgraded;
        inner.state = state;
        Ok(())
    }

    /// Retry releases left unconfirmed by an earlier tick
    async fn retry_unconfirmed_releases(&self, inner: &mut LoopState) {
        if inner.unconfirmed_releases.is_empty() {
            return;
        }

        let timeout = self.config.call_timeout;
        let attempts = inner.unconfirmed_releases.iter().map(|(shard, address)| async move {
            let result = with_timeout("release", timeout, self.store.release(address, *shard)).await;
            (*shard, result)
        });

        let results = join_all(attempts).await;
        for (shard, result) in results {
            match result {
                Ok(()) => {
                    debug!("Confirmed release of shard {}", shard);
                    inner.unconfirmed_releases.remove(&shard);
                }
                Err(e) => debug!("Release of shard {} still unconfirmed: {}", shard, e),
            }
        }
    }

    /// Re-send assign notifications until acknowledged
    async fn flush_pending_assigns(&self, inner: &mut LoopState) {
        if inner.pending_assigns.is_empty() {
            return;
        }

        let pending: Vec<(RunnerAddress, ShardId)> = inner.pending_assigns.iter().cloned().collect();
        for (address, shard, ok) in self.notify_each(pending, true).await {
            if ok {
                inner.pending_assigns.remove(&(address, shard));
            }
        }
    }

    /// Place unowned shards; only granted acquires are committed
    async fn assign_unassigned(&self, inner: &mut LoopState) -> Result<usize> {
        let decisions = decide_assignments_for_unassigned_shards(&inner.state);
        if decisions.is_empty() {
            return Ok(0);
        }

        let granted = self.acquire_all(decisions.assignments).await;
        let mut assigned = 0;
        let mut to_notify = Vec::new();
        for (address, shards) in granted {
            for shard in &shards {
                inner.state.set_owner(*shard, Some(address.clone()))?;
                to_notify.push((address.clone(), *shard));
            }
            assigned += shards.len();
            info!("Assigned shards {:?} to {}", shards, address);
            self.events.publish(CoordinatorEvent::ShardsAssigned { address, shards });
        }

        self.notify_and_track(inner, to_notify).await;
        Ok(assigned)
    }

    /// Move shards toward balance with release-before-acquire ordering
    ///
    /// Stalls while any release is unconfirmed: shards already stopped
    /// keep their owner and no further shards are stopped.
    async fn rebalance(&self, inner: &mut LoopState) -> Result<usize> {
        if !inner.unconfirmed_releases.is_empty() {
            debug!(
                "Rebalance skipped: {} releases unconfirmed",
                inner.unconfirmed_releases.len()
            );
            return Ok(0);
        }

        let mut decisions =
            decide_assignments_for_unbalanced_shards(&inner.state, self.config.rebalance_threshold);
        if let Some(max) = self.config.max_moves_per_tick {
            decisions.limit(max);
        }
        if decisions.is_empty() {
            return Ok(0);
        }

        // Stop the sources first
        let stops: Vec<(RunnerAddress, ShardId)> = decisions
            .unassignments
            .iter()
            .flat_map(|(address, shards)| shards.iter().map(move |s| (address.clone(), *s)))
            .collect();

        let mut stopped = Vec::new();
        for (address, shard, ok) in self.notify_each(stops, false).await {
            if ok {
                stopped.push((address, shard));
            } else {
                // Unknown whether it stopped; make sure it serves again
                inner.pending_assigns.insert((address, shard));
            }
        }

        // Then release; a shard is free only once its release is confirmed
        let timeout = self.config.call_timeout;
        let releases = stopped.into_iter().map(|(address, shard)| async move {
            let result = with_timeout("release", timeout, self.store.release(&address, shard)).await;
            (address, shard, result)
        });

        let mut released: BTreeMap<RunnerAddress, Vec<ShardId>> = BTreeMap::new();
        let results = join_all(releases).await;
        for (address, shard, result) in results {
            match result {
                Ok(()) => {
                    inner.state.set_owner(shard, None)?;
                    released.entry(address).or_default().push(shard);
                }
                Err(e) => {
                    warn!("Release of shard {} by {} unconfirmed: {}", shard, address, e);
                    inner.unconfirmed_releases.insert(shard, address);
                }
            }
        }

        let released_shards: BTreeSet<ShardId> = released.values().flatten().copied().collect();
        for (address, shards) in released {
            info!("Unassigned shards {:?} from {}", shards, address);
            self.events.publish(CoordinatorEvent::ShardsUnassigned { address, shards });
        }

        // Only now acquire on behalf of the destinations
        let mut acquisitions: BTreeMap<RunnerAddress, BTreeSet<ShardId>> = BTreeMap::new();
        for shard in released_shards {
            if let Some(address) = decisions.destination_of(shard) {
                acquisitions.entry(address.clone()).or_default().insert(shard);
            }
        }

        let mut moved = 0;
        let mut to_notify = Vec::new();
        for (address, shards) in self.acquire_all(acquisitions).await {
            for shard in &shards {
                inner.state.set_owner(*shard, Some(address.clone()))?;
                to_notify.push((address.clone(), *shard));
            }
            moved += shards.len();
            info!("Moved shards {:?} to {}", shards, address);
            self.events.publish(CoordinatorEvent::ShardsAssigned { address, shards });
        }
        standard::SHARD_MOVES.inc_by(moved as u64);

        self.notify_and_track(inner, to_notify).await;
        Ok(moved)
    }

    /// Acquire concurrently per runner; failed or timed-out calls grant nothing
    async fn acquire_all(
        &self,
        requests: BTreeMap<RunnerAddress, BTreeSet<ShardId>>,
    ) -> Vec<(RunnerAddress, Vec<ShardId>)> {
        let timeout = self.config.call_timeout;
        let calls = requests.into_iter().map(|(address, shards)| async move {
            let wanted: Vec<ShardId> = shards.into_iter().collect();
            let granted = match with_timeout("acquire", timeout, self.store.acquire(&address, &wanted)).await {
                Ok(granted) => granted,
                Err(e) => {
                    warn!("Acquire of {} shards for {} failed: {}", wanted.len(), address, e);
                    Vec::new()
                }
            };
            if granted.len() < wanted.len() {
                standard::PARTIAL_GRANTS.inc();
                debug!("Acquire for {} granted {}/{}", address, granted.len(), wanted.len());
            }
            // Never commit a shard that was not requested
            let granted: Vec<ShardId> = granted.into_iter().filter(|s| wanted.contains(s)).collect();
            (address, granted)
        });

        join_all(calls)
            .await
            .into_iter()
            .filter(|(_, granted)| !granted.is_empty())
            .collect()
    }

    /// Notify concurrently; returns each target with whether it acknowledged
    async fn notify_each(
        &self,
        targets: Vec<(RunnerAddress, ShardId)>,
        assign: bool,
    ) -> Vec<(RunnerAddress, ShardId, bool)> {
        let timeout = self.config.call_timeout;
        let calls = targets.into_iter().map(|(address, shard)| async move {
            let call = if assign {
                self.notifier.notify_assign(&address, shard)
            } else {
                self.notifier.notify_unassign(&address, shard)
            };
            let ok = match with_timeout("notify", timeout, call).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("Runner {} did not acknowledge shard {}: {}", address, shard, e);
                    false
                }
            };
            (address, shard, ok)
        });
        join_all(calls).await
    }

    async fn notify_and_track(&self, inner: &mut LoopState, targets: Vec<(RunnerAddress, ShardId)>) {
        for (address, shard, ok) in self.notify_each(targets, true).await {
            if !ok {
                inner.pending_assigns.insert((address, shard));
            }
        }
    }

    /// Save assignments and the live directory, retrying transient failures
    async fn persist(&self, inner: &LoopState) -> Result<()> {
        let timeout = self.config.call_timeout;
        let store = &self.store;
        let assignments = &inner.state.assignment;
        let directory: Vec<Runner> = inner
            .state
            .runners
            .values()
            .map(|registered| registered.runner.clone())
            .collect();
        let runners = directory.as_slice();

        self.config
            .persist_retry
            .run("save_assignments", move || {
                with_timeout("save_assignments", timeout, store.save_assignments(assignments))
            })
            .await?;
        self.config
            .persist_retry
            .run("save_runners", move || {
                with_timeout("save_runners", timeout, store.save_runners(runners))
            })
            .await?;

        debug!("Persisted state at {}", self.clock.now());
        Ok(())
    }
}
