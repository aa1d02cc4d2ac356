//! Shard coordination
//!
//! Pure placement planning over a state snapshot, plus the loop that
//! reconciles that snapshot against the lease store and drives runners.

pub mod events;
pub mod leader;
pub mod membership;
pub mod planner;
pub mod state;

pub use events::{CoordinatorEvent, EventBus};
pub use leader::{Coordinator, CoordinatorConfig, CoordinatorStatus, TickReport};
pub use membership::{MembershipChange, MembershipManager};
pub use planner::{
    decide_assignments_for_unassigned_shards, decide_assignments_for_unbalanced_shards,
    decide_assignments_for_unbalanced_shards_pinned, Decisions,
};
pub use state::{CoordinatorState, RegisteredRunner, Runner, RunnerAddress, ShardId};
