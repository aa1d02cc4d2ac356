//! Shard assignment planner
//!
//! Pure functions that decide which shards move where, given a
//! [`CoordinatorState`] snapshot. Nothing here mutates state or touches
//! storage; the coordinator loop confirms every decision through the
//! lease store before committing it.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use tracing::debug;

use super::state::{CoordinatorState, RunnerAddress, ShardId};

/// Planned shard movements
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Decisions {
    /// Shards each runner should start serving
    pub assignments: BTreeMap<RunnerAddress, BTreeSet<ShardId>>,
    /// Shards each runner should stop serving
    pub unassignments: BTreeMap<RunnerAddress, BTreeSet<ShardId>>,
}

impl Decisions {
    /// True when nothing moves
    pub fn is_empty(&self) -> bool {
        self.assignments.values().all(|s| s.is_empty())
            && self.unassignments.values().all(|s| s.is_empty())
    }

    /// Number of shards receiving a new owner
    pub fn assigned_count(&self) -> usize {
        self.assignments.values().map(|s| s.len()).sum()
    }

    /// Destination runner of a shard, if it is being assigned
    pub fn destination_of(&self, shard: ShardId) -> Option<&RunnerAddress> {
        self.assignments
            .iter()
            .find(|(_, shards)| shards.contains(&shard))
            .map(|(address, _)| address)
    }

    /// Keep only the `max` lowest shard ids
    pub fn limit(&mut self, max: usize) {
        let keep: BTreeSet<ShardId> = self
            .assignments
            .values()
            .flatten()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .take(max)
            .collect();
        self.retain(|shard| keep.contains(&shard));
    }

    fn retain(&mut self, keep: impl Fn(ShardId) -> bool) {
        for map in [&mut self.assignments, &mut self.unassignments] {
            for shards in map.values_mut() {
                shards.retain(|s| keep(*s));
            }
            map.retain(|_, shards| !shards.is_empty());
        }
    }
}

/// Place every unowned shard on the least-loaded registered runner
///
/// Loads include shards already placed earlier in the same call, so a
/// burst of unowned shards spreads evenly. Ties go to the lowest address.
/// With no registered runners nothing is decided. No version constraint
/// applies since there is no previous owner.
pub fn decide_assignments_for_unassigned_shards(state: &CoordinatorState) -> Decisions {
    let mut decisions = Decisions::default();
    if state.runners.is_empty() {
        return decisions;
    }

    let mut by_load: BinaryHeap<Reverse<(usize, RunnerAddress)>> = state
        .loads()
        .into_iter()
        .map(|(address, count)| Reverse((count, address)))
        .collect();

    for shard in state.unassigned_shards() {
        let Some(Reverse((count, address))) = by_load.pop() else {
            break;
        };
        decisions
            .assignments
            .entry(address.clone())
            .or_default()
            .insert(shard);
        by_load.push(Reverse((count + 1, address)));
    }

    debug!(
        "Planned {} unassigned shards across {} runners",
        decisions.assigned_count(),
        decisions.assignments.len()
    );

    decisions
}

/// Move shards from overloaded runners to underloaded ones
///
/// A shard only ever moves to a runner whose version is at least that of
/// its current owner. Moves are simulated greedily: the most-loaded runner
/// donates its lowest shard id to the least-loaded eligible runner while
/// their difference exceeds `rebalance_threshold` (a threshold of zero
/// behaves like one, since a single move cannot improve a difference of
/// one). The result is a fixed point: applying it and planning again
/// yields no decisions.
pub fn decide_assignments_for_unbalanced_shards(
    state: &CoordinatorState,
    rebalance_threshold: u32,
) -> Decisions {
    decide_assignments_for_unbalanced_shards_pinned(state, rebalance_threshold, &BTreeSet::new())
}

/// Same as [`decide_assignments_for_unbalanced_shards`], but `pinned`
/// shards still count toward their owner's load and never move
pub fn decide_assignments_for_unbalanced_shards_pinned(
    state: &CoordinatorState,
    rebalance_threshold: u32,
    pinned: &BTreeSet<ShardId>,
) -> Decisions {
    let mut decisions = Decisions::default();
    if state.runners.is_empty() {
        return decisions;
    }

    let tolerated = rebalance_threshold.max(1) as usize;
    let versions: BTreeMap<&RunnerAddress, u64> = state
        .runners
        .iter()
        .map(|(address, registered)| (address, registered.version()))
        .collect();

    let mut held: BTreeMap<RunnerAddress, BTreeSet<ShardId>> = state
        .runners
        .keys()
        .map(|address| (address.clone(), BTreeSet::new()))
        .collect();
    let mut original: BTreeMap<ShardId, RunnerAddress> = BTreeMap::new();
    for (shard, owner) in &state.assignment {
        if let Some(address) = owner {
            if let Some(shards) = held.get_mut(address) {
                shards.insert(*shard);
                original.insert(*shard, address.clone());
            }
        }
    }

    // shard -> destination, for shards not back with their original owner
    let mut moved: BTreeMap<ShardId, RunnerAddress> = BTreeMap::new();

    while let Some((donor, receiver, shard)) =
        next_move(&held, &versions, &moved, pinned, tolerated)
    {
        if let Some(shards) = held.get_mut(&donor) {
            shards.remove(&shard);
        }
        if let Some(shards) = held.get_mut(&receiver) {
            shards.insert(shard);
        }
        if original.get(&shard) == Some(&receiver) {
            moved.remove(&shard);
        } else {
            moved.insert(shard, receiver);
        }
    }

    for (shard, destination) in moved {
        if let Some(source) = original.get(&shard) {
            decisions
                .unassignments
                .entry(source.clone())
                .or_default()
                .insert(shard);
            decisions
                .assignments
                .entry(destination)
                .or_default()
                .insert(shard);
        }
    }

    debug!(
        "Planned {} rebalance moves (threshold {})",
        decisions.assigned_count(),
        rebalance_threshold
    );

    decisions
}

/// Pick the next `(donor, receiver, shard)` move, if any improves balance
fn next_move(
    held: &BTreeMap<RunnerAddress, BTreeSet<ShardId>>,
    versions: &BTreeMap<&RunnerAddress, u64>,
    moved: &BTreeMap<ShardId, RunnerAddress>,
    pinned: &BTreeSet<ShardId>,
    tolerated: usize,
) -> Option<(RunnerAddress, RunnerAddress, ShardId)> {
    let mut donors: Vec<(&RunnerAddress, &BTreeSet<ShardId>)> = held.iter().collect();
    donors.sort_by(|a, b| b.1.len().cmp(&a.1.len()).then_with(|| a.0.cmp(b.0)));

    for (donor, donor_shards) in donors {
        let donor_version = versions.get(donor).copied().unwrap_or(0);

        // Least loaded receiver running the same or a newer build
        let receiver = held
            .iter()
            .filter(|(address, _)| *address != donor)
            .filter(|(address, _)| versions.get(address).copied().unwrap_or(0) >= donor_version)
            .min_by_key(|(_, shards)| shards.len());

        let Some((receiver, receiver_shards)) = receiver else {
            continue;
        };
        if donor_shards.len() <= receiver_shards.len() + tolerated {
            continue;
        }

        // Prefer shards that have not moved yet in this plan
        let movable = |s: &&ShardId| !pinned.contains(*s);
        let shard = donor_shards
            .iter()
            .filter(movable)
            .find(|s| !moved.contains_key(*s))
            .or_else(|| donor_shards.iter().find(movable));

        if let Some(shard) = shard {
            return Some((donor.clone(), receiver.clone(), *shard));
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::state::Runner;
    use chrono::Utc;

    fn addr(host: &str) -> RunnerAddress {
        RunnerAddress::new(host, 9000)
    }

    fn state_with(shard_count: u32, runners: &[(&str, u64, &[ShardId])]) -> CoordinatorState {
        let mut state = CoordinatorState::new(shard_count);
        for (host, version, shards) in runners {
            state.register(Runner::new(addr(host), *version), Utc::now());
            for shard in *shards {
                state.set_owner(*shard, Some(addr(host))).unwrap();
            }
        }
        state
    }

    #[test]
    fn test_unassigned_spread_evenly() {
        let state = state_with(10, &[("a", 1, &[]), ("b", 1, &[]), ("c", 1, &[])]);
        let decisions = decide_assignments_for_unassigned_shards(&state);

        assert!(decisions.unassignments.is_empty());
        assert_eq!(decisions.assigned_count(), 10);
        let sizes: Vec<usize> = decisions.assignments.values().map(|s| s.len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
    }

    #[test]
    fn test_unassigned_prefers_idle_runner() {
        let state = state_with(4, &[("a", 1, &[1, 2]), ("b", 1, &[])]);
        let decisions = decide_assignments_for_unassigned_shards(&state);

        assert_eq!(decisions.assignments[&addr("b")], BTreeSet::from([3, 4]));
        assert!(!decisions.assignments.contains_key(&addr("a")));
    }

    #[test]
    fn test_unassigned_without_runners() {
        let state = CoordinatorState::new(5);
        assert!(decide_assignments_for_unassigned_shards(&state).is_empty());
    }

    #[test]
    fn test_pinned_shards_never_move() {
        let state = state_with(4, &[("a", 1, &[1, 2, 3, 4]), ("b", 1, &[])]);
        let pinned = BTreeSet::from([1, 2]);
        let decisions = decide_assignments_for_unbalanced_shards_pinned(&state, 1, &pinned);

        assert_eq!(decisions.assignments[&addr("b")], BTreeSet::from([3, 4]));
    }

    #[test]
    fn test_limit_keeps_lowest_shards() {
        let state = state_with(6, &[("a", 1, &[1, 2, 3, 4, 5, 6]), ("b", 1, &[])]);
        let mut decisions = decide_assignments_for_unbalanced_shards(&state, 1);
        assert_eq!(decisions.assigned_count(), 3);

        decisions.limit(2);
        assert_eq!(decisions.assignments[&addr("b")], BTreeSet::from([1, 2]));
        assert_eq!(decisions.unassignments[&addr("a")], BTreeSet::from([1, 2]));
        assert_eq!(decisions.destination_of(1), Some(&addr("b")));
        assert_eq!(decisions.destination_of(3), None);
    }
}
