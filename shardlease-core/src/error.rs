//! Error types for the shard coordinator
//!
//! Error taxonomy covering lease storage, coordination,
//! runner protocol and configuration errors.

use std::time::Duration;
use thiserror::Error;

/// Primary error type for all coordinator and runner operations
#[derive(Debug, Error)]
pub enum ShardLeaseError {
    // ========== Storage Errors ==========

    /// Lease store backend unreachable or rejected the operation
    #[error("Persistence failed: {message}")]
    Persistence { message: String },

    /// Stored document could not be encoded or decoded
    #[error("Serialization failed: {message}")]
    Serialization { message: String },

    // ========== Coordination Errors ==========

    /// Coordinator state broke one of its structural invariants
    #[error("Invariant violated: {reason}")]
    InvariantViolation { reason: String },

    /// Runner address is not in the directory
    #[error("Runner {address} not registered")]
    UnknownRunner { address: String },

    /// A bounded call did not complete in time
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    // ========== Protocol Errors ==========

    /// Runner address string is malformed
    #[error("Invalid runner address {input:?}: {reason}")]
    InvalidAddress { input: String, reason: String },

    /// Runner did not acknowledge an assign/unassign notification
    #[error("Notification to {address} failed: {reason}")]
    NotificationFailed { address: String, reason: String },

    // ========== Configuration Errors ==========

    /// Configuration value out of range or unparsable
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // ========== Runtime Errors ==========

    /// Shutdown in progress
    #[error("Shutdown in progress")]
    ShutdownInProgress,

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ShardLeaseError {
    /// Returns true if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShardLeaseError::Persistence { .. }
                | ShardLeaseError::Timeout { .. }
                | ShardLeaseError::NotificationFailed { .. }
        )
    }

    /// Shorthand for a persistence failure
    pub fn persistence(message: impl Into<String>) -> Self {
        ShardLeaseError::Persistence { message: message.into() }
    }
}

impl From<serde_json::Error> for ShardLeaseError {
    fn from(e: serde_json::Error) -> Self {
        ShardLeaseError::Serialization { message: e.to_string() }
    }
}

/// Result type alias for shard coordinator operations
pub type Result<T> = std::result::Result<T, ShardLeaseError>;
