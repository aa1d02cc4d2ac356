//! Lease store
//!
//! The sole shared, crash-durable authority over shard ownership. Runners
//! hold TTL-bounded leases on shards; the coordinator acquires and releases
//! them on the runners' behalf and observes expiry as failure.
//!
//! Every operation may fail with [`ShardLeaseError::Persistence`] and is
//! safe to retry.
//!
//! [`ShardLeaseError::Persistence`]: crate::error::ShardLeaseError::Persistence

pub mod clock;
pub mod file;
pub mod memory;
pub mod tables;

pub use clock::{Clock, ManualClock, SystemClock};
pub use file::FileLeaseStore;
pub use memory::MemoryLeaseStore;
pub use tables::{Lease, LeaseTables};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::coordinator::state::{Runner, RunnerAddress, ShardId};
use crate::error::Result;

/// Shard -> owner snapshot as persisted
pub type Assignments = BTreeMap<ShardId, Option<RunnerAddress>>;

/// Logical contract of the lease store
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Full shard -> owner snapshot
    async fn get_assignments(&self) -> Result<Assignments>;

    /// Durably overwrite the given shard -> owner entries
    async fn save_assignments(&self, entries: &Assignments) -> Result<()>;

    /// Runner directory
    async fn get_runners(&self) -> Result<BTreeMap<RunnerAddress, Runner>>;

    /// Durably overwrite the given runner entries
    async fn save_runners(&self, entries: &[Runner]) -> Result<()>;

    /// Delete runner directory entries and their liveness leases
    async fn remove_runners(&self, addresses: &[RunnerAddress]) -> Result<()>;

    /// Take exclusive TTL leases on `shards` for `address`.
    /// Returns the subset actually granted.
    async fn acquire(&self, address: &RunnerAddress, shards: &[ShardId]) -> Result<Vec<ShardId>>;

    /// Extend live leases already held by `address`.
    /// Returns the subset actually extended.
    async fn refresh(&self, address: &RunnerAddress, shards: &[ShardId]) -> Result<Vec<ShardId>>;

    /// Give up one lease held by `address`
    async fn release(&self, address: &RunnerAddress, shard: ShardId) -> Result<()>;

    /// Give up every lease held by `address`
    async fn release_all(&self, address: &RunnerAddress) -> Result<()>;

    /// Write the runner's directory entry and start its liveness lease
    async fn register(&self, runner: &Runner) -> Result<()>;

    /// Extend the runner's liveness lease; `false` if it is not in the directory
    async fn heartbeat(&self, address: &RunnerAddress) -> Result<bool>;

    /// Liveness lease expiry per runner
    async fn runner_expirations(&self) -> Result<BTreeMap<RunnerAddress, DateTime<Utc>>>;

    /// Owners of shard leases that are live right now
    async fn lease_owners(&self) -> Result<BTreeMap<ShardId, RunnerAddress>>;
}
