//! Runner state machine
//!
//! Tracks the local runner's phase and the shards it currently serves.

use std::collections::BTreeSet;
use tokio::sync::RwLock;

use crate::coordinator::state::{Runner, ShardId};

/// Runner lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerPhase {
    /// Not yet in the directory
    Starting,
    /// Registered, heartbeating
    Registered,
    /// Giving up leases before exit
    Draining,
    /// Stopped
    Stopped,
}

/// Local runner state
pub struct RunnerState {
    runner: Runner,
    phase: RwLock<RunnerPhase>,
    /// Shards being served right now
    served: RwLock<BTreeSet<ShardId>>,
}

impl RunnerState {
    /// Create new runner state
    pub fn new(runner: Runner) -> Self {
        Self {
            runner,
            phase: RwLock::new(RunnerPhase::Starting),
            served: RwLock::new(BTreeSet::new()),
        }
    }

    /// Identity of this runner
    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Get current phase
    pub async fn phase(&self) -> RunnerPhase {
        *self.phase.read().await
    }

    /// Set phase
    pub async fn set_phase(&self, phase: RunnerPhase) {
        *self.phase.write().await = phase;
    }

    /// Start serving a shard; false if already served
    pub async fn start_serving(&self, shard: ShardId) -> bool {
        self.served.write().await.insert(shard)
    }

    /// Stop serving a shard; false if it was not served
    pub async fn stop_serving(&self, shard: ShardId) -> bool {
        self.served.write().await.remove(&shard)
    }

    /// Shards served, ascending
    pub async fn served(&self) -> Vec<ShardId> {
        self.served.read().await.iter().copied().collect()
    }

    /// Keep only `still_held` among the served shards, returning the ones dropped
    pub async fn retain(&self, still_held: &[ShardId]) -> Vec<ShardId> {
        let keep: BTreeSet<ShardId> = still_held.iter().copied().collect();
        let mut served = self.served.write().await;
        let lost: Vec<ShardId> = served.difference(&keep).copied().collect();
        served.retain(|s| keep.contains(s));
        lost
    }

    /// Stop serving everything, returning what was served
    pub async fn clear(&self) -> Vec<ShardId> {
        let mut served = self.served.write().await;
        let all = served.iter().copied().collect();
        served.clear();
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::state::RunnerAddress;

    #[tokio::test]
    async fn test_retain_reports_lost_shards() {
        let state = RunnerState::new(Runner::new(RunnerAddress::new("a", 1), 1));
        for shard in [1, 2, 3] {
            assert!(state.start_serving(shard).await);
        }
        assert!(!state.start_serving(2).await);

        let lost = state.retain(&[1, 3, 9]).await;
        assert_eq!(lost, vec![2]);
        assert_eq!(state.served().await, vec![1, 3]);
        assert_eq!(state.clear().await, vec![1, 3]);
        assert_eq!(state.phase().await, RunnerPhase::Starting);
    }
}
