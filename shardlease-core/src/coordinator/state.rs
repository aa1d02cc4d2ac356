//! Coordinator state model
//!
//! Registered runners and the shard -> runner assignment, with the
//! structural invariants every observable state must satisfy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use super::planner::Decisions;
use crate::error::{Result, ShardLeaseError};

/// Shard identifier in `[1, shard_count]`
pub type ShardId = u32;

/// Network identity of a runner process
///
/// Encoded as `host:port`. The port is taken from after the last `:`,
/// so hosts containing colons survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct RunnerAddress {
    pub host: String,
    pub port: u16,
}

impl RunnerAddress {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Encode as `host:port`
    pub fn encode(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Decode from `host:port`
    pub fn decode(input: &str) -> Result<Self> {
        let (host, port) = input.rsplit_once(':').ok_or_else(|| ShardLeaseError::InvalidAddress {
            input: input.into(),
            reason: "missing ':' separator".into(),
        })?;

        let port = port.parse::<u16>().map_err(|e| ShardLeaseError::InvalidAddress {
            input: input.into(),
            reason: format!("bad port: {}", e),
        })?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for RunnerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for RunnerAddress {
    type Err = ShardLeaseError;

    fn from_str(s: &str) -> Result<Self> {
        Self::decode(s)
    }
}

impl From<RunnerAddress> for String {
    fn from(address: RunnerAddress) -> Self {
        address.encode()
    }
}

impl TryFrom<String> for RunnerAddress {
    type Error = ShardLeaseError;

    fn try_from(value: String) -> Result<Self> {
        Self::decode(&value)
    }
}

/// A runner process and the build it runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Runner {
    pub address: RunnerAddress,
    /// Monotonic build/deploy number, gates rebalancing during rolling upgrades
    pub version: u64,
}

impl Runner {
    pub fn new(address: RunnerAddress, version: u64) -> Self {
        Self { address, version }
    }
}

/// Runner as known to the coordinator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredRunner {
    pub runner: Runner,
    /// First time the coordinator observed this runner; informational only
    pub registered_at: DateTime<Utc>,
}

impl RegisteredRunner {
    pub fn new(runner: Runner, registered_at: DateTime<Utc>) -> Self {
        Self { runner, registered_at }
    }

    pub fn version(&self) -> u64 {
        self.runner.version
    }
}

/// Snapshot of runners and shard ownership
///
/// Ordered maps keep every iteration (and therefore every planner
/// decision) deterministic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorState {
    pub runners: BTreeMap<RunnerAddress, RegisteredRunner>,
    pub assignment: BTreeMap<ShardId, Option<RunnerAddress>>,
}

impl CoordinatorState {
    /// Empty state with every shard in `[1, shard_count]` unowned
    pub fn new(shard_count: u32) -> Self {
        Self {
            runners: BTreeMap::new(),
            assignment: (1..=shard_count).map(|id| (id, None)).collect(),
        }
    }

    /// Number of shards in the universe
    pub fn shard_count(&self) -> u32 {
        self.assignment.len() as u32
    }

    /// Add or replace a runner
    pub fn register(&mut self, runner: Runner, registered_at: DateTime<Utc>) {
        let address = runner.address.clone();
        self.runners
            .insert(address, RegisteredRunner::new(runner, registered_at));
    }

    /// Drop a runner, returning the shards it owned (now unowned)
    pub fn remove_runner(&mut self, address: &RunnerAddress) -> BTreeSet<ShardId> {
        self.runners.remove(address);
        let mut orphaned = BTreeSet::new();
        for (shard, owner) in self.assignment.iter_mut() {
            if owner.as_ref() == Some(address) {
                *owner = None;
                orphaned.insert(*shard);
            }
        }
        orphaned
    }

    /// Set the owner of one shard
    pub fn set_owner(&mut self, shard: ShardId, owner: Option<RunnerAddress>) -> Result<()> {
        if let Some(address) = &owner {
            if !self.runners.contains_key(address) {
                return Err(ShardLeaseError::UnknownRunner { address: address.encode() });
            }
        }
        let len = self.assignment.len();
        let slot = self.assignment.get_mut(&shard).ok_or_else(|| {
            ShardLeaseError::InvariantViolation {
                reason: format!("shard {} outside [1, {}]", shard, len),
            }
        })?;
        *slot = owner;
        Ok(())
    }

    /// Current owner of a shard
    pub fn owner(&self, shard: ShardId) -> Option<&RunnerAddress> {
        self.assignment.get(&shard).and_then(|o| o.as_ref())
    }

    /// Shards owned by a runner, ascending
    pub fn shards_of(&self, address: &RunnerAddress) -> BTreeSet<ShardId> {
        self.assignment
            .iter()
            .filter(|(_, owner)| owner.as_ref() == Some(address))
            .map(|(shard, _)| *shard)
            .collect()
    }

    /// Shard count per registered runner, including runners with none
    pub fn loads(&self) -> BTreeMap<RunnerAddress, usize> {
        let mut loads: BTreeMap<RunnerAddress, usize> =
            self.runners.keys().map(|a| (a.clone(), 0)).collect();
        for owner in self.assignment.values().flatten() {
            if let Some(count) = loads.get_mut(owner) {
                *count += 1;
            }
        }
        loads
    }

    /// Shards with no owner, ascending
    pub fn unassigned_shards(&self) -> Vec<ShardId> {
        self.assignment
            .iter()
            .filter(|(_, owner)| owner.is_none())
            .map(|(shard, _)| *shard)
            .collect()
    }

    /// Number of shards with an owner
    pub fn assigned_count(&self) -> usize {
        self.assignment.values().filter(|o| o.is_some()).count()
    }

    /// Apply planner decisions: unassignments first, then assignments
    pub fn apply(&mut self, decisions: &Decisions) -> Result<()> {
        for (address, shards) in &decisions.unassignments {
            for shard in shards {
                if self.owner(*shard) != Some(address) {
                    return Err(ShardLeaseError::InvariantViolation {
                        reason: format!("shard {} is not owned by {}", shard, address),
                    });
                }
                self.set_owner(*shard, None)?;
            }
        }
        for (address, shards) in &decisions.assignments {
            for shard in shards {
                self.set_owner(*shard, Some(address.clone()))?;
            }
        }
        Ok(())
    }

    /// Verify the shard universe is exactly `[1, shard_count]` and every
    /// owner is a registered runner
    pub fn check_invariants(&self, shard_count: u32) -> Result<()> {
        if self.assignment.len() != shard_count as usize
            || self.assignment.keys().copied().ne(1..=shard_count)
        {
            return Err(ShardLeaseError::InvariantViolation {
                reason: format!(
                    "assignment covers {} shards, expected exactly 1..={}",
                    self.assignment.len(),
                    shard_count
                ),
            });
        }

        for (shard, owner) in &self.assignment {
            if let Some(address) = owner {
                if !self.runners.contains_key(address) {
                    return Err(ShardLeaseError::InvariantViolation {
                        reason: format!("shard {} owned by unregistered runner {}", shard, address),
                    });
                }
            }
        }

        for (key, registered) in &self.runners {
            if key != &registered.runner.address {
                return Err(ShardLeaseError::InvariantViolation {
                    reason: format!("runner keyed {} carries address {}", key, registered.runner.address),
                });
            }
        }

        Ok(())
    }
}
