//! Async runtime helpers
//!
//! Retry with backoff, per-call timeouts, and cooperative shutdown.

pub mod retry;
pub mod shutdown;

pub use retry::{with_timeout, RetryPolicy};
pub use shutdown::ShutdownSignal;
