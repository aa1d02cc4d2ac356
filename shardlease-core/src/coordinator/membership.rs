//! Runner membership
//!
//! Tracks which runners are live according to their liveness leases in
//! the store, and when the coordinator first saw each of them.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::state::{RegisteredRunner, Runner, RunnerAddress};

/// Membership changes observed in one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipChange {
    /// Runners seen live for the first time
    pub joined: Vec<RunnerAddress>,
    /// Runners whose liveness lease lapsed or whose entry vanished
    pub expired: Vec<RunnerAddress>,
    /// Live runners that reported a new version
    pub upgraded: Vec<RunnerAddress>,
}

impl MembershipChange {
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.expired.is_empty() && self.upgraded.is_empty()
    }
}

/// Live runner set, owned by the coordinator loop
#[derive(Debug, Default)]
pub struct MembershipManager {
    live: BTreeMap<RunnerAddress, RegisteredRunner>,
}

impl MembershipManager {
    /// Create an empty membership view
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile against the stored directory and liveness leases
    ///
    /// A directory entry is live iff its liveness lease expires after `now`.
    /// Directory entries with a lapsed (or missing) lease are reported in
    /// `expired` so the caller can remove them from storage.
    pub fn reconcile(
        &mut self,
        directory: &BTreeMap<RunnerAddress, Runner>,
        expirations: &BTreeMap<RunnerAddress, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> MembershipChange {
        let mut change = MembershipChange::default();

        for (address, runner) in directory {
            let live = expirations.get(address).is_some_and(|expires| now < *expires);

            if !live {
                if self.live.remove(address).is_some() {
                    warn!("Runner {} lease expired, dropping it", address);
                }
                change.expired.push(address.clone());
                continue;
            }

            match self.live.get_mut(address) {
                Some(known) if known.runner.version != runner.version => {
                    info!(
                        "Runner {} version {} -> {}",
                        address, known.runner.version, runner.version
                    );
                    known.runner.version = runner.version;
                    change.upgraded.push(address.clone());
                }
                Some(_) => {}
                None => {
                    info!("Registered runner {} (version {})", address, runner.version);
                    self.live
                        .insert(address.clone(), RegisteredRunner::new(runner.clone(), now));
                    change.joined.push(address.clone());
                }
            }
        }

        // Entries removed from the directory by someone else
        let vanished: Vec<RunnerAddress> = self
            .live
            .keys()
            .filter(|address| !directory.contains_key(*address))
            .cloned()
            .collect();
        for address in vanished {
            warn!("Runner {} left the directory", address);
            self.live.remove(&address);
            change.expired.push(address);
        }

        change
    }

    /// Live runners
    pub fn live(&self) -> &BTreeMap<RunnerAddress, RegisteredRunner> {
        &self.live
    }

    /// Check whether a runner is live
    pub fn is_live(&self, address: &RunnerAddress) -> bool {
        self.live.contains_key(address)
    }

    /// Number of live runners
    pub fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn addr(host: &str) -> RunnerAddress {
        RunnerAddress::new(host, 5000)
    }

    #[test]
    fn test_join_and_expire() {
        let mut membership = MembershipManager::new();
        let now = Utc::now();
        let directory = BTreeMap::from([
            (addr("a"), Runner::new(addr("a"), 1)),
            (addr("b"), Runner::new(addr("b"), 1)),
        ]);
        let expirations = BTreeMap::from([
            (addr("a"), now + Duration::seconds(30)),
            (addr("b"), now + Duration::seconds(10)),
        ]);

        let change = membership.reconcile(&directory, &expirations, now);
        assert_eq!(change.joined, vec![addr("a"), addr("b")]);
        assert!(change.expired.is_empty());

        let later = now + Duration::seconds(10);
        let change = membership.reconcile(&directory, &expirations, later);
        assert!(change.joined.is_empty());
        assert_eq!(change.expired, vec![addr("b")]);
        assert!(membership.is_live(&addr("a")));
        assert!(!membership.is_live(&addr("b")));
    }

    #[test]
    fn test_registered_at_is_kept() {
        let mut membership = MembershipManager::new();
        let now = Utc::now();
        let directory = BTreeMap::from([(addr("a"), Runner::new(addr("a"), 1))]);
        let expirations = BTreeMap::from([(addr("a"), now + Duration::seconds(60))]);

        membership.reconcile(&directory, &expirations, now);
        let upgraded = BTreeMap::from([(addr("a"), Runner::new(addr("a"), 2))]);
        let change = membership.reconcile(&upgraded, &expirations, now + Duration::seconds(5));

        assert_eq!(change.upgraded, vec![addr("a")]);
        let known = &membership.live()[&addr("a")];
        assert_eq!(known.registered_at, now);
        assert_eq!(known.version(), 2);
    }

    #[test]
    fn test_missing_liveness_lease_is_expired() {
        let mut membership = MembershipManager::new();
        let directory = BTreeMap::from([(addr("a"), Runner::new(addr("a"), 1))]);
        let change = membership.reconcile(&directory, &BTreeMap::new(), Utc::now());

        assert_eq!(change.expired, vec![addr("a")]);
        assert_eq!(membership.live_count(), 0);
    }

    #[test]
    fn test_vanished_entry_is_dropped() {
        let mut membership = MembershipManager::new();
        let now = Utc::now();
        let directory = BTreeMap::from([(addr("a"), Runner::new(addr("a"), 1))]);
        let expirations = BTreeMap::from([(addr("a"), now + Duration::seconds(60))]);
        membership.reconcile(&directory, &expirations, now);

        let change = membership.reconcile(&BTreeMap::new(), &expirations, now);
        assert_eq!(change.expired, vec![addr("a")]);
    }
}
