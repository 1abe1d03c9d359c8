use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::trace;

use jobvault_core::error::require_non_blank;
use jobvault_core::{DocumentId, Lease};

use super::error::{LockError, LockResult};
use super::handle::LockHandle;
use crate::store::{DocumentStore, StoreError};

/// Pause between two create attempts on a contended key.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Floor for the TTL written on a lease.
const MIN_LEASE_TTL_SECS: u64 = 60;

/// TTL (seconds) of a lease acquired with `timeout`: `max(60, ⌊1.5 × timeout⌋)`.
pub fn lease_ttl_secs(timeout: Duration) -> u64 {
    MIN_LEASE_TTL_SECS.max((timeout.as_secs_f64() * 1.5) as u64)
}

/// Acquires leases on named keys and runs actions under them.
///
/// Exclusivity comes from the store's create-if-absent on the lock
/// partition; the executor itself keeps no state, so clones share nothing
/// but the store.
#[derive(Clone)]
pub struct DistributedLockExecutor {
    store: Arc<dyn DocumentStore>,
}

impl DistributedLockExecutor {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Poll until the lease for `key` is created or `timeout` has elapsed.
    ///
    /// Contention is retried after `min(remaining, 1s)`. Any store error other
    /// than a create conflict is returned immediately.
    pub fn acquire_lock(&self, key: &str, timeout: Duration) -> LockResult<LockHandle> {
        require_non_blank("key", key)?;

        let ttl = lease_ttl_secs(timeout);
        let started = Instant::now();
        let mut attempts: u32 = 0;

        trace!(key, ?timeout, ttl, "acquiring lock");

        loop {
            attempts += 1;
            let lease = Lease::new(DocumentId::from(key), Utc::now(), Some(ttl));

            match self.store.create(lease.into_document()) {
                Ok(doc) => {
                    let lease = Lease::try_from(doc)?;
                    trace!(key, attempts, "lock acquired");
                    return Ok(LockHandle::new(lease, self.store.clone()));
                }
                Err(StoreError::Conflict(_)) => {
                    trace!(key, attempts, "lock is held; will retry");
                }
                Err(e) => return Err(LockError::Store(e)),
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                trace!(key, attempts, "lock timeout reached");
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    timeout,
                });
            }

            thread::sleep((timeout - elapsed).min(RETRY_DELAY));
        }
    }

    /// Run `action` while holding `key`. The lease is released afterwards,
    /// also when `action` unwinds.
    pub fn invoke<T>(&self, key: &str, timeout: Duration, action: impl FnOnce() -> T) -> LockResult<T> {
        let handle = self.acquire_lock(key, timeout)?;
        let result = action();
        handle.release();
        Ok(result)
    }

    /// Like [`invoke`](Self::invoke), but a timeout on `key` yields
    /// `Ok(None)` and `action` is not run.
    pub fn try_invoke<T>(
        &self,
        key: &str,
        timeout: Duration,
        action: impl FnOnce() -> T,
    ) -> LockResult<Option<T>> {
        match self.invoke(key, timeout, action) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_timeout_for(key) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl core::fmt::Debug for DistributedLockExecutor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DistributedLockExecutor").finish_non_exhaustive()
    }
}
