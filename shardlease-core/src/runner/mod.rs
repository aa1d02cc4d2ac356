//! Runner side of the protocol
//!
//! A runner registers itself, keeps its leases alive, and serves the
//! shards the coordinator tells it to.

pub mod keeper;
pub mod notifier;
pub mod state;

pub use keeper::{KeeperConfig, LeaseKeeper};
pub use notifier::{HttpNotifier, NotifierConfig, RunnerNotifier};
pub use state::{RunnerPhase, RunnerState};
