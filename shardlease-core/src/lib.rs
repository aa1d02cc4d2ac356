//! ShardLease - lease-based shard coordination
//!
//! This crate assigns a fixed universe of shards to a dynamic set of runners:
//! - Planning placement and rebalancing as pure functions
//! - Lease-fenced ownership, so a shard is never served twice
//! - A periodic coordinator loop that reconciles against the store
//! - A runner-side lease keeper

pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod runner;
pub mod runtime;
pub mod storage;

pub use coordinator::{Coordinator, CoordinatorConfig};
pub use error::{Result, ShardLeaseError};
pub use storage::LeaseStore;

/// Default shard lease TTL in seconds
pub const DEFAULT_LEASE_TTL_SECS: u64 = 30;

/// Default lease refresh interval in seconds
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 20;

/// Default tolerated load difference between compatible runners
pub const DEFAULT_REBALANCE_THRESHOLD: u32 = 1;
