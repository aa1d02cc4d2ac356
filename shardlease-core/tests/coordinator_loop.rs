//! Coordinator loop tests
//!
//! Drives whole ticks against the in-memory lease store with a manual
//! clock, a recording notifier, and a store wrapper that can fail on demand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use shardlease_core::coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorEvent, Runner, RunnerAddress, ShardId,
};
use shardlease_core::runner::RunnerNotifier;
use shardlease_core::runtime::{RetryPolicy, ShutdownSignal};
use shardlease_core::storage::{Assignments, LeaseStore, ManualClock, MemoryLeaseStore};
use shardlease_core::{Result, ShardLeaseError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Assign(RunnerAddress, ShardId),
    Unassign(RunnerAddress, ShardId),
    Acquire(RunnerAddress, Vec<ShardId>),
    Release(RunnerAddress, ShardId),
}

/// Shared, ordered log of notifier and store calls
type CallLog = Arc<Mutex<Vec<Call>>>;

#[derive(Default)]
struct RecordingNotifier {
    log: CallLog,
    unreachable: Mutex<BTreeSet<RunnerAddress>>,
}

impl RecordingNotifier {
    fn check(&self, address: &RunnerAddress) -> Result<()> {
        if self.unreachable.lock().contains(address) {
            return Err(ShardLeaseError::NotificationFailed {
                address: address.encode(),
                reason: "connection refused".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RunnerNotifier for RecordingNotifier {
    async fn notify_assign(&self, address: &RunnerAddress, shard: ShardId) -> Result<()> {
        self.check(address)?;
        self.log.lock().push(Call::Assign(address.clone(), shard));
        Ok(())
    }

    async fn notify_unassign(&self, address: &RunnerAddress, shard: ShardId) -> Result<()> {
        self.check(address)?;
        self.log.lock().push(Call::Unassign(address.clone(), shard));
        Ok(())
    }
}

/// Delegates to a memory store, logging fencing calls and failing on demand
struct FlakyStore {
    inner: MemoryLeaseStore,
    log: CallLog,
    fail_saves: AtomicBool,
    fail_releases: AtomicBool,
    fail_reads: AtomicBool,
    /// Registered behind the coordinator's back right after its next directory read
    register_after_read: Mutex<Option<Runner>>,
}

impl FlakyStore {
    fn outage(&self, flag: &AtomicBool) -> Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(ShardLeaseError::persistence("backend unreachable"));
        }
        Ok(())
    }
}

#[async_trait]
impl LeaseStore for FlakyStore {
    async fn get_assignments(&self) -> Result<Assignments> {
        self.outage(&self.fail_reads)?;
        self.inner.get_assignments().await
    }

    async fn save_assignments(&self, entries: &Assignments) -> Result<()> {
        self.outage(&self.fail_saves)?;
        self.inner.save_assignments(entries).await
    }

    async fn get_runners(&self) -> Result<BTreeMap<RunnerAddress, Runner>> {
        self.outage(&self.fail_reads)?;
        let runners = self.inner.get_runners().await?;
        let late = self.register_after_read.lock().take();
        if let Some(runner) = late {
            self.inner.register(&runner).await?;
        }
        Ok(runners)
    }

    async fn save_runners(&self, entries: &[Runner]) -> Result<()> {
        self.outage(&self.fail_saves)?;
        self.inner.save_runners(entries).await
    }

    async fn remove_runners(&self, addresses: &[RunnerAddress]) -> Result<()> {
        self.inner.remove_runners(addresses).await
    }

    async fn acquire(&self, address: &RunnerAddress, shards: &[ShardId]) -> Result<Vec<ShardId>> {
        self.log.lock().push(Call::Acquire(address.clone(), shards.to_vec()));
        self.inner.acquire(address, shards).await
    }

    async fn refresh(&self, address: &RunnerAddress, shards: &[ShardId]) -> Result<Vec<ShardId>> {
        self.inner.refresh(address, shards).await
    }

    async fn release(&self, address: &RunnerAddress, shard: ShardId) -> Result<()> {
        self.outage(&self.fail_releases)?;
        self.log.lock().push(Call::Release(address.clone(), shard));
        self.inner.release(address, shard).await
    }

    async fn release_all(&self, address: &RunnerAddress) -> Result<()> {
        self.inner.release_all(address).await
    }

    async fn register(&self, runner: &Runner) -> Result<()> {
        self.inner.register(runner).await
    }

    async fn heartbeat(&self, address: &RunnerAddress) -> Result<bool> {
        self.inner.heartbeat(address).await
    }

    async fn runner_expirations(&self) -> Result<BTreeMap<RunnerAddress, DateTime<Utc>>> {
        self.outage(&self.fail_reads)?;
        self.inner.runner_expirations().await
    }

    async fn lease_owners(&self) -> Result<BTreeMap<ShardId, RunnerAddress>> {
        self.outage(&self.fail_reads)?;
        self.inner.lease_owners().await
    }
}

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<FlakyStore>,
    notifier: Arc<RecordingNotifier>,
    log: CallLog,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::default());
        let log = CallLog::default();
        let inner = MemoryLeaseStore::with_clock(Duration::from_secs(30), clock.clone()).unwrap();
        let store = Arc::new(FlakyStore {
            inner,
            log: log.clone(),
            fail_saves: AtomicBool::new(false),
            fail_releases: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            register_after_read: Mutex::new(None),
        });
        let notifier = Arc::new(RecordingNotifier {
            log: log.clone(),
            ..Default::default()
        });
        Self { clock, store, notifier, log }
    }

    fn coordinator(&self, config: CoordinatorConfig) -> Coordinator {
        Coordinator::new(config, self.store.clone(), self.notifier.clone(), self.clock.clone()).unwrap()
    }

    async fn join(&self, host: &str, version: u64) -> RunnerAddress {
        let address = RunnerAddress::new(host, 7000);
        self.store.register(&Runner::new(address.clone(), version)).await.unwrap();
        address
    }

    /// Heartbeat and refresh like a live runner's keeper would
    async fn keep_alive(&self, address: &RunnerAddress) {
        assert!(self.store.heartbeat(address).await.unwrap());
        let owned: Vec<ShardId> = self
            .store
            .lease_owners()
            .await
            .unwrap()
            .into_iter()
            .filter(|(_, owner)| owner == address)
            .map(|(shard, _)| shard)
            .collect();
        self.store.refresh(address, &owned).await.unwrap();
    }

    fn take_log(&self) -> Vec<Call> {
        std::mem::take(&mut *self.log.lock())
    }
}

fn config(shard_count: u32) -> CoordinatorConfig {
    CoordinatorConfig {
        shard_count,
        persist_retry: RetryPolicy::none(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_first_tick_places_every_shard() {
    let harness = Harness::new();
    let a = harness.join("a", 1).await;
    let b = harness.join("b", 1).await;
    let coordinator = harness.coordinator(config(6));

    let report = coordinator.tick().await.unwrap();
    assert_eq!(report.joined, vec![a.clone(), b.clone()]);
    assert_eq!(report.assigned, 6);

    let state = coordinator.state();
    assert_eq!(state.shards_of(&a).len(), 3);
    assert_eq!(state.shards_of(&b).len(), 3);
    state.check_invariants(6).unwrap();

    // Storage agrees with memory
    let owners = harness.store.lease_owners().await.unwrap();
    let stored = harness.store.get_assignments().await.unwrap();
    for shard in 1..=6 {
        assert_eq!(owners.get(&shard), state.owner(shard));
        assert_eq!(stored[&shard].as_ref(), state.owner(shard));
    }

    let assigns = harness
        .take_log()
        .into_iter()
        .filter(|call| matches!(call, Call::Assign(..)))
        .count();
    assert_eq!(assigns, 6);
}

#[tokio::test]
async fn test_tick_without_runners_leaves_shards_unowned() {
    let harness = Harness::new();
    let coordinator = harness.coordinator(config(4));

    let report = coordinator.tick().await.unwrap();
    assert_eq!(report.assigned, 0);
    assert_eq!(coordinator.status().unassigned, 4);
}

#[tokio::test]
async fn test_expired_runner_shards_move_to_survivor() {
    let harness = Harness::new();
    let a = harness.join("a", 1).await;
    let b = harness.join("b", 1).await;
    let coordinator = harness.coordinator(config(6));
    coordinator.tick().await.unwrap();

    harness.clock.advance(Duration::from_secs(20));
    harness.keep_alive(&a).await;
    harness.clock.advance(Duration::from_secs(15));

    let report = coordinator.tick().await.unwrap();
    assert_eq!(report.expired, vec![b.clone()]);
    assert_eq!(report.assigned, 3);

    let state = coordinator.state();
    assert!(!state.runners.contains_key(&b));
    assert_eq!(state.shards_of(&a).len(), 6);
    assert!(!harness.store.get_runners().await.unwrap().contains_key(&b));
}

#[tokio::test]
async fn test_rebalance_releases_before_acquiring() {
    let harness = Harness::new();
    let a = harness.join("a", 1).await;
    let coordinator = harness.coordinator(config(4));
    coordinator.tick().await.unwrap();
    harness.take_log();

    let b = harness.join("b", 1).await;
    let report = coordinator.tick().await.unwrap();
    assert_eq!(report.moved, 2);

    let log = harness.take_log();
    let moved = coordinator.state().shards_of(&b);
    assert_eq!(moved.len(), 2);

    let position = |wanted: &Call| log.iter().position(|call| call == wanted);
    let acquire_at = log
        .iter()
        .position(|call| matches!(call, Call::Acquire(address, _) if *address == b))
        .unwrap();

    for shard in moved {
        let stop = position(&Call::Unassign(a.clone(), shard)).unwrap();
        let release = position(&Call::Release(a.clone(), shard)).unwrap();
        let start = position(&Call::Assign(b.clone(), shard)).unwrap();
        assert!(stop < release, "shard {} released before its runner stopped", shard);
        assert!(release < acquire_at, "shard {} acquired before release", shard);
        assert!(acquire_at < start, "shard {} started before acquire", shard);
    }
}

#[tokio::test]
async fn test_unconfirmed_release_stalls_rebalance_until_retried() {
    let harness = Harness::new();
    let a = harness.join("a", 1).await;
    let coordinator = harness.coordinator(config(4));
    coordinator.tick().await.unwrap();

    let b = harness.join("b", 1).await;
    harness.store.fail_releases.store(true, Ordering::SeqCst);
    let report = coordinator.tick().await.unwrap();

    assert_eq!(report.moved, 0);
    assert_eq!(report.unconfirmed, 2);
    assert_eq!(coordinator.state().shards_of(&a).len(), 4);
    assert!(coordinator.state().shards_of(&b).is_empty());

    // While releases stay unconfirmed no further shards are stopped
    harness.take_log();
    let report = coordinator.tick().await.unwrap();
    let log = harness.take_log();
    assert!(!log.iter().any(|call| matches!(call, Call::Unassign(..))));
    assert!(!log.iter().any(|call| matches!(call, Call::Acquire(..))));
    assert_eq!(report.moved, 0);
    assert_eq!(report.unconfirmed, 2);
    assert_eq!(coordinator.state().shards_of(&a).len(), 4);

    // Once the releases land the freed shards are placed on b
    harness.store.fail_releases.store(false, Ordering::SeqCst);
    let report = coordinator.tick().await.unwrap();
    assert_eq!(report.unconfirmed, 0);
    assert_eq!(report.assigned, 2);
    assert_eq!(report.moved, 0);

    let state = coordinator.state();
    assert_eq!(state.shards_of(&a).len(), 2);
    assert_eq!(state.shards_of(&b).len(), 2);
    assert_eq!(harness.store.lease_owners().await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_persist_keeps_version_registered_mid_tick() {
    let harness = Harness::new();
    let a = harness.join("a", 1).await;
    let coordinator = harness.coordinator(config(2));
    coordinator.tick().await.unwrap();

    // a restarts on a newer build between the directory read and the save
    *harness.store.register_after_read.lock() = Some(Runner::new(a.clone(), 2));
    coordinator.tick().await.unwrap();
    assert_eq!(harness.store.get_runners().await.unwrap()[&a].version, 2);

    let report = coordinator.tick().await.unwrap();
    assert_eq!(report.upgraded, vec![a.clone()]);
    assert_eq!(coordinator.state().runners[&a].version(), 2);
    assert_eq!(harness.store.get_runners().await.unwrap()[&a].version, 2);
}

#[tokio::test]
async fn test_persistence_failure_aborts_tick() {
    let harness = Harness::new();
    harness.join("a", 1).await;
    let coordinator = harness.coordinator(config(3));

    harness.store.fail_saves.store(true, Ordering::SeqCst);
    let err = coordinator.tick().await.unwrap_err();
    assert!(matches!(err, ShardLeaseError::Persistence { .. }));
    assert!(harness.store.get_assignments().await.unwrap().is_empty());

    harness.store.fail_saves.store(false, Ordering::SeqCst);
    coordinator.tick().await.unwrap();

    let stored = harness.store.get_assignments().await.unwrap();
    assert_eq!(stored.len(), 3);
    assert!(stored.values().all(|owner| owner.is_some()));
}

#[tokio::test]
async fn test_storage_outage_keeps_last_known_owners() {
    let harness = Harness::new();
    let a = harness.join("a", 1).await;
    let coordinator = harness.coordinator(config(3));
    coordinator.tick().await.unwrap();

    harness.store.fail_reads.store(true, Ordering::SeqCst);
    assert!(coordinator.tick().await.is_err());
    assert_eq!(coordinator.state().shards_of(&a).len(), 3);
}

#[tokio::test]
async fn test_partial_grant_commits_only_granted_shards() {
    let harness = Harness::new();
    let a = harness.join("a", 1).await;

    // Held by a process the coordinator does not know about
    let stranger = RunnerAddress::new("stranger", 7000);
    harness.store.acquire(&stranger, &[2]).await.unwrap();

    let coordinator = harness.coordinator(config(3));
    let report = coordinator.tick().await.unwrap();

    assert_eq!(report.assigned, 2);
    let state = coordinator.state();
    assert_eq!(state.owner(2), None);
    assert_eq!(state.shards_of(&a), BTreeSet::from([1, 3]));
}

#[tokio::test]
async fn test_failed_notification_is_retried() {
    let harness = Harness::new();
    let a = harness.join("a", 1).await;
    harness.notifier.unreachable.lock().insert(a.clone());
    let coordinator = harness.coordinator(config(2));

    let report = coordinator.tick().await.unwrap();
    assert_eq!(report.assigned, 2);
    assert_eq!(report.pending_notifications, 2);

    harness.notifier.unreachable.lock().clear();
    harness.take_log();
    let report = coordinator.tick().await.unwrap();
    assert_eq!(report.pending_notifications, 0);

    let log = harness.take_log();
    assert!(log.contains(&Call::Assign(a.clone(), 1)));
    assert!(log.contains(&Call::Assign(a, 2)));
}

#[tokio::test]
async fn test_restarted_coordinator_rebuilds_from_store() {
    let harness = Harness::new();
    harness.join("a", 1).await;
    harness.join("b", 2).await;

    let first = harness.coordinator(config(10));
    first.tick().await.unwrap();
    let before = first.state();
    drop(first);
    harness.take_log();

    let second = harness.coordinator(config(10));
    let report = second.tick().await.unwrap();

    assert_eq!(report.assigned, 0);
    assert_eq!(report.moved, 0);
    assert_eq!(second.state().assignment, before.assignment);
    assert!(harness.take_log().is_empty(), "Restart should not re-notify");
}

#[tokio::test]
async fn test_max_moves_per_tick() {
    let harness = Harness::new();
    harness.join("a", 1).await;
    let coordinator = harness.coordinator(CoordinatorConfig {
        max_moves_per_tick: Some(1),
        ..config(6)
    });
    coordinator.tick().await.unwrap();

    let b = harness.join("b", 1).await;
    assert_eq!(coordinator.tick().await.unwrap().moved, 1);
    assert_eq!(coordinator.tick().await.unwrap().moved, 1);
    assert_eq!(coordinator.tick().await.unwrap().moved, 1);
    assert_eq!(coordinator.tick().await.unwrap().moved, 0);
    assert_eq!(coordinator.state().shards_of(&b).len(), 3);
}

#[tokio::test]
async fn test_events_are_published() {
    let harness = Harness::new();
    let a = harness.join("a", 1).await;
    let coordinator = harness.coordinator(config(2));
    let mut events = coordinator.subscribe();

    coordinator.tick().await.unwrap();

    assert_eq!(
        events.recv().await.unwrap(),
        CoordinatorEvent::RunnerRegistered { address: a.clone() }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        CoordinatorEvent::ShardsAssigned { address: a, shards: vec![1, 2] }
    );
}

#[tokio::test(start_paused = true)]
async fn test_started_loop_ticks_until_shutdown() {
    let harness = Harness::new();
    let a = harness.join("a", 1).await;
    let coordinator = Arc::new(harness.coordinator(config(3)));
    let shutdown = ShutdownSignal::new();

    let handle = coordinator.clone().start(shutdown.clone());
    tokio::time::sleep(Duration::from_secs(1)).await;
    shutdown.shutdown();
    handle.await.unwrap();

    assert_eq!(coordinator.state().shards_of(&a).len(), 3);
}
