//! Error types for distributed lock operations.

use std::time::Duration;

use thiserror::Error;

use jobvault_core::DomainError;

use crate::store::StoreError;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors that can occur during lock operations.
///
/// Contention is never surfaced directly: conflicts are retried until the
/// caller's timeout elapses and only then become `Timeout`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Invalid input (e.g. blank resource key)
    #[error(transparent)]
    Validation(#[from] DomainError),

    /// No lease could be created within the timeout
    #[error("could not place a lock on [{key}]: lock timeout reached [{timeout:?}]")]
    Timeout { key: String, timeout: Duration },

    /// Store fault other than contention; never retried by the lock layer
    #[error("lock store error: {0}")]
    Store(#[from] StoreError),
}

impl LockError {
    /// Whether this is a timeout for exactly `key`.
    ///
    /// Callers that skip a cycle on contention must only swallow timeouts for
    /// the lease they asked for, never one raised by a nested lease.
    pub fn is_timeout_for(&self, key: &str) -> bool {
        matches!(self, LockError::Timeout { key: k, .. } if k == key)
    }
}
