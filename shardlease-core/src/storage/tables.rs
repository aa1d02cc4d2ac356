//! Lease store tables
//!
//! The persisted logical layout shared by every backend: assignments,
//! runner directory, shard leases and runner liveness leases. All lease
//! operations are compare-and-swap on `expires_at` against an explicit
//! `now`, so a backend only has to make one read-modify-write atomic.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use super::Assignments;
use crate::coordinator::state::{Runner, RunnerAddress, ShardId};

/// Exclusive, time-bounded claim on a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub owner: RunnerAddress,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Live until strictly before `expires_at`
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

/// Runner directory entry as persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerRecord {
    pub version: u64,
}

/// All lease store tables
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseTables {
    #[serde(default)]
    pub assignments: Assignments,
    #[serde(default)]
    pub runners: BTreeMap<RunnerAddress, RunnerRecord>,
    #[serde(default)]
    pub leases: BTreeMap<ShardId, Lease>,
    #[serde(default)]
    pub runner_leases: BTreeMap<RunnerAddress, DateTime<Utc>>,
}

impl LeaseTables {
    pub fn save_assignments(&mut self, entries: &Assignments) {
        for (shard, owner) in entries {
            self.assignments.insert(*shard, owner.clone());
        }
    }

    pub fn runners(&self) -> BTreeMap<RunnerAddress, Runner> {
        self.runners
            .iter()
            .map(|(address, record)| (address.clone(), Runner::new(address.clone(), record.version)))
            .collect()
    }

    /// Upsert directory entries; a stored version is never lowered
    pub fn save_runners(&mut self, entries: &[Runner]) {
        for runner in entries {
            let record = self
                .runners
                .entry(runner.address.clone())
                .or_insert(RunnerRecord { version: runner.version });
            record.version = record.version.max(runner.version);
        }
    }

    pub fn remove_runners(&mut self, addresses: &[RunnerAddress]) {
        for address in addresses {
            self.runners.remove(address);
            self.runner_leases.remove(address);
        }
    }

    /// Grant each shard whose lease is free, expired, or already ours
    pub fn acquire(
        &mut self,
        address: &RunnerAddress,
        shards: &[ShardId],
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Vec<ShardId> {
        let mut granted = Vec::with_capacity(shards.len());
        for shard in shards {
            let free = match self.leases.get(shard) {
                Some(lease) => !lease.is_live(now) || &lease.owner == address,
                None => true,
            };
            if free {
                self.leases.insert(
                    *shard,
                    Lease { owner: address.clone(), expires_at: now + ttl },
                );
                granted.push(*shard);
            }
        }
        if granted.len() < shards.len() {
            debug!(
                "Acquire for {} granted {}/{} shards",
                address,
                granted.len(),
                shards.len()
            );
        }
        granted
    }

    /// Extend only leases that are ours and still live
    pub fn refresh(
        &mut self,
        address: &RunnerAddress,
        shards: &[ShardId],
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Vec<ShardId> {
        let mut extended = Vec::with_capacity(shards.len());
        for shard in shards {
            if let Some(lease) = self.leases.get_mut(shard) {
                if &lease.owner == address && lease.is_live(now) {
                    lease.expires_at = now + ttl;
                    extended.push(*shard);
                }
            }
        }
        extended
    }

    pub fn release(&mut self, address: &RunnerAddress, shard: ShardId) {
        if self.leases.get(&shard).is_some_and(|l| &l.owner == address) {
            self.leases.remove(&shard);
        }
    }

    pub fn release_all(&mut self, address: &RunnerAddress) {
        self.leases.retain(|_, lease| &lease.owner != address);
    }

    pub fn register(&mut self, runner: &Runner, now: DateTime<Utc>, ttl: Duration) {
        self.runners
            .insert(runner.address.clone(), RunnerRecord { version: runner.version });
        self.runner_leases.insert(runner.address.clone(), now + ttl);
    }

    pub fn heartbeat(&mut self, address: &RunnerAddress, now: DateTime<Utc>, ttl: Duration) -> bool {
        if !self.runners.contains_key(address) {
            return false;
        }
        self.runner_leases.insert(address.clone(), now + ttl);
        true
    }

    pub fn lease_owners(&self, now: DateTime<Utc>) -> BTreeMap<ShardId, RunnerAddress> {
        self.leases
            .iter()
            .filter(|(_, lease)| lease.is_live(now))
            .map(|(shard, lease)| (*shard, lease.owner.clone()))
            .collect()
    }
}
