//! In-process lease store
//!
//! Reference backend holding the tables behind a single mutex. Not durable
//! across process restarts; used for tests and single-process setups.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::clock::{Clock, SystemClock};
use super::tables::LeaseTables;
use super::{Assignments, LeaseStore};
use crate::coordinator::state::{Runner, RunnerAddress, ShardId};
use crate::error::{Result, ShardLeaseError};

/// Lease store kept in memory
pub struct MemoryLeaseStore {
    tables: Mutex<LeaseTables>,
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
}

impl MemoryLeaseStore {
    /// Store with the default lease TTL and the system clock
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(LeaseTables::default()),
            clock: Arc::new(SystemClock),
            ttl: chrono::Duration::seconds(crate::DEFAULT_LEASE_TTL_SECS as i64),
        }
    }

    /// Store with an explicit TTL and time source
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Result<Self> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| ShardLeaseError::InvalidConfig {
            reason: format!("lease ttl out of range: {}", e),
        })?;
        Ok(Self {
            tables: Mutex::new(LeaseTables::default()),
            clock,
            ttl,
        })
    }

    /// Copy of the raw tables, for inspection
    pub fn snapshot(&self) -> LeaseTables {
        self.tables.lock().clone()
    }
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn get_assignments(&self) -> Result<Assignments> {
        Ok(self.tables.lock().assignments.clone())
    }

    async fn save_assignments(&self, entries: &Assignments) -> Result<()> {
        self.tables.lock().save_assignments(entries);
        Ok(())
    }

    async fn get_runners(&self) -> Result<BTreeMap<RunnerAddress, Runner>> {
        Ok(self.tables.lock().runners())
    }

    async fn save_runners(&self, entries: &[Runner]) -> Result<()> {
        self.tables.lock().save_runners(entries);
        Ok(())
    }

    async fn remove_runners(&self, addresses: &[RunnerAddress]) -> Result<()> {
        self.tables.lock().remove_runners(addresses);
        Ok(())
    }

    async fn acquire(&self, address: &RunnerAddress, shards: &[ShardId]) -> Result<Vec<ShardId>> {
        let now = self.clock.now();
        Ok(self.tables.lock().acquire(address, shards, now, self.ttl))
    }

    async fn refresh(&self, address: &RunnerAddress, shards: &[ShardId]) -> Result<Vec<ShardId>> {
        let now = self.clock.now();
        Ok(self.tables.lock().refresh(address, shards, now, self.ttl))
    }

    async fn release(&self, address: &RunnerAddress, shard: ShardId) -> Result<()> {
        self.tables.lock().release(address, shard);
        Ok(())
    }

    async fn release_all(&self, address: &RunnerAddress) -> Result<()> {
        self.tables.lock().release_all(address);
        Ok(())
    }

    async fn register(&self, runner: &Runner) -> Result<()> {
        let now = self.clock.now();
        self.tables.lock().register(runner, now, self.ttl);
        Ok(())
    }

    async fn heartbeat(&self, address: &RunnerAddress) -> Result<bool> {
        let now = self.clock.now();
        Ok(self.tables.lock().heartbeat(address, now, self.ttl))
    }

    async fn runner_expirations(&self) -> Result<BTreeMap<RunnerAddress, DateTime<Utc>>> {
        Ok(self.tables.lock().runner_leases.clone())
    }

    async fn lease_owners(&self) -> Result<BTreeMap<ShardId, RunnerAddress>> {
        let now = self.clock.now();
        Ok(self.tables.lock().lease_owners(now))
    }
}
