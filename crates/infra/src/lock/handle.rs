//! Lock handle: keeps one lease alive until it is released.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, error, trace, warn};

use jobvault_core::time::to_epoch;
use jobvault_core::{DocumentId, DocumentType, Lease, PatchOperation};

use crate::store::{DocumentStore, StoreError};

/// Lower bound between two heartbeats.
const MIN_RENEWAL_DELAY: Duration = Duration::from_secs(1);

/// Lifecycle of a lease as seen by its handle.
///
/// `Acquired -> Renewing* -> {Released | Fenced | Reaped}`. `Fenced` and
/// `Reaped` stop renewal without releasing the handle: the holder no longer
/// has exclusivity even though it still owns the handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LeaseState {
    /// Created; no heartbeat sent yet.
    Acquired,
    /// At least one heartbeat succeeded.
    Renewing,
    /// Released by the holder.
    Released,
    /// A heartbeat was rejected because another writer changed the lease.
    Fenced,
    /// A heartbeat found no lease: it expired and was reclaimed.
    Reaped,
}

impl LeaseState {
    /// Whether exclusivity has been lost without a release.
    pub fn is_lost(self) -> bool {
        matches!(self, LeaseState::Fenced | LeaseState::Reaped)
    }

    fn renews(self) -> bool {
        matches!(self, LeaseState::Acquired | LeaseState::Renewing)
    }
}

/// Delay before the next heartbeat of a lease with `ttl_secs`.
pub fn renewal_delay(ttl_secs: u64) -> Duration {
    (Duration::from_secs(ttl_secs) / 2).max(MIN_RENEWAL_DELAY)
}

struct Tracked {
    lease: Lease,
    state: LeaseState,
}

struct Shared {
    store: Arc<dyn DocumentStore>,
    tracked: Mutex<Tracked>,
    wake: Condvar,
}

impl Shared {
    /// Conditional heartbeat. Runs with the handle mutex held, so it never
    /// overlaps a release.
    fn renew(&self, tracked: &mut Tracked) {
        let key = tracked.lease.id.clone();
        trace!(key = %key, "sending lease keep-alive");

        let heartbeat = [PatchOperation::SetHeartbeat(to_epoch(Utc::now()))];
        match self.store.patch(
            DocumentType::Lock,
            &key,
            &heartbeat,
            tracked.lease.etag.as_ref(),
        ) {
            Ok(doc) => match Lease::try_from(doc) {
                Ok(lease) => {
                    tracked.lease = lease;
                    tracked.state = LeaseState::Renewing;
                    trace!(key = %key, "lease keep-alive sent");
                }
                Err(e) => debug!(key = %key, error = %e, "keep-alive returned an unreadable lease"),
            },
            Err(StoreError::PreconditionFailed(_)) => {
                tracked.state = LeaseState::Fenced;
                warn!(
                    key = %key,
                    "lease was updated by another holder; keep-alive stopped"
                );
            }
            Err(StoreError::NotFound(_)) => {
                tracked.state = LeaseState::Reaped;
                warn!(key = %key, "lease no longer exists; keep-alive stopped");
            }
            Err(e) => debug!(key = %key, error = %e, "unable to send lease keep-alive; will retry"),
        }
    }
}

/// Exclusive hold on one resource key.
///
/// While the lease carries a TTL, a dedicated thread refreshes its heartbeat
/// every `max(1s, ttl / 2)`. Releasing (explicitly or on drop) deletes the
/// lease document so the next acquirer does not have to wait for the TTL.
///
/// `release` is idempotent and may be called from any thread.
pub struct LockHandle {
    key: DocumentId,
    shared: Arc<Shared>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl LockHandle {
    pub(crate) fn new(lease: Lease, store: Arc<dyn DocumentStore>) -> Self {
        let key = lease.id.clone();
        let renews = lease.time_to_live.is_some();

        let shared = Arc::new(Shared {
            store,
            tracked: Mutex::new(Tracked {
                lease,
                state: LeaseState::Acquired,
            }),
            wake: Condvar::new(),
        });

        let renewal = if renews {
            let worker = shared.clone();
            match thread::Builder::new()
                .name(format!("lease-renewal:{key}"))
                .spawn(move || renewal_loop(worker))
            {
                Ok(join) => Some(join),
                Err(e) => {
                    // The lease is still protected until its TTL runs out.
                    error!(key = %key, error = %e, "failed to spawn lease renewal thread");
                    None
                }
            }
        } else {
            None
        };

        Self {
            key,
            shared,
            renewal: Mutex::new(renewal),
        }
    }

    pub fn key(&self) -> &DocumentId {
        &self.key
    }

    pub fn state(&self) -> LeaseState {
        self.shared
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Whether renewal stopped because the lease was fenced or reaped.
    ///
    /// Holders of long critical sections should poll this and abort rather
    /// than assume they are still exclusive.
    pub fn is_lost(&self) -> bool {
        self.state().is_lost()
    }

    /// Snapshot of the lease as last written by this handle.
    pub fn lease(&self) -> Lease {
        self.shared
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .lease
            .clone()
    }

    /// Delete the lease and stop renewing.
    ///
    /// A lease that was fenced or reaped is not deleted: the document with
    /// that id, if any, belongs to someone else now.
    pub fn release(&self) {
        {
            let mut tracked = self
                .shared
                .tracked
                .lock()
                .unwrap_or_else(PoisonError::into_inner);

            if tracked.state == LeaseState::Released {
                return;
            }

            let previous = tracked.state;
            tracked.state = LeaseState::Released;

            if previous.is_lost() {
                debug!(key = %self.key, state = ?previous, "lease already lost; nothing to delete");
            } else {
                match self.shared.store.delete(DocumentType::Lock, &self.key) {
                    Ok(()) => {}
                    Err(StoreError::NotFound(_)) => {
                        trace!(key = %self.key, "unable to release the lock: already gone");
                    }
                    Err(e) => error!(key = %self.key, error = %e, "unable to release the lock"),
                }
            }
            trace!(key = %self.key, "lock released");
        }

        self.shared.wake.notify_all();

        let renewal = self
            .renewal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(join) = renewal {
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl core::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}

fn renewal_loop(shared: Arc<Shared>) {
    let mut tracked = shared
        .tracked
        .lock()
        .unwrap_or_else(PoisonError::into_inner);

    loop {
        let Some(ttl) = tracked.lease.time_to_live else {
            return;
        };
        let deadline = Instant::now() + renewal_delay(ttl);

        loop {
            if !tracked.state.renews() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tracked = shared
                .wake
                .wait_timeout(tracked, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        shared.renew(&mut tracked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use crate::testing::FaultyStore;

    fn held_lease(store: &Arc<dyn DocumentStore>, key: &str, ttl: Option<u64>) -> Lease {
        let doc = store
            .create(Lease::new(key.into(), Utc::now(), ttl).into_document())
            .unwrap();
        Lease::try_from(doc).unwrap()
    }

    fn stored_lease(store: &Arc<dyn DocumentStore>, key: &str) -> Option<Lease> {
        store
            .read(DocumentType::Lock, &DocumentId::from(key))
            .unwrap()
            .map(|doc| Lease::try_from(doc).unwrap())
    }

    #[test]
    fn renewal_delay_is_half_ttl_with_a_floor() {
        assert_eq!(renewal_delay(90), Duration::from_secs(45));
        assert_eq!(renewal_delay(1), Duration::from_secs(1));
        assert_eq!(renewal_delay(0), Duration::from_secs(1));
    }

    #[test]
    fn release_deletes_the_lease_and_is_idempotent() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let handle = LockHandle::new(held_lease(&store, "locks:a", Some(60)), store.clone());

        handle.release();
        assert!(stored_lease(&store, "locks:a").is_none());
        assert_eq!(handle.state(), LeaseState::Released);

        // Someone else takes the key; a second release must not touch it.
        held_lease(&store, "locks:a", Some(60));
        handle.release();
        drop(handle);
        assert!(stored_lease(&store, "locks:a").is_some());
    }

    #[test]
    fn drop_releases() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        {
            let _handle = LockHandle::new(held_lease(&store, "locks:a", Some(60)), store.clone());
            assert!(stored_lease(&store, "locks:a").is_some());
        }
        assert!(stored_lease(&store, "locks:a").is_none());
    }

    #[test]
    fn release_from_another_thread() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let handle = Arc::new(LockHandle::new(
            held_lease(&store, "locks:a", Some(2)),
            store.clone(),
        ));

        let remote = handle.clone();
        thread::spawn(move || remote.release()).join().unwrap();

        assert_eq!(handle.state(), LeaseState::Released);
        assert!(stored_lease(&store, "locks:a").is_none());
    }

    #[test]
    fn heartbeat_advances_while_held() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let lease = held_lease(&store, "locks:a", Some(2));
        let first_heartbeat = lease.last_heartbeat;
        let first_token = lease.etag.clone();
        let handle = LockHandle::new(lease, store.clone());

        // ttl 2s -> heartbeat every second; after 2.5s the lease would have
        // expired without renewal.
        thread::sleep(Duration::from_millis(2500));

        let current = stored_lease(&store, "locks:a").expect("lease kept alive");
        assert!(current.last_heartbeat > first_heartbeat);
        assert_ne!(current.etag, first_token);
        assert_eq!(handle.state(), LeaseState::Renewing);
        assert_eq!(handle.lease().etag, current.etag);
    }

    #[test]
    fn overwritten_lease_fences_the_handle() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let handle = LockHandle::new(held_lease(&store, "locks:a", Some(2)), store.clone());

        // Another process rewrites the lease, changing its opacity token.
        store
            .patch(
                DocumentType::Lock,
                &DocumentId::from("locks:a"),
                &[PatchOperation::SetHeartbeat(to_epoch(Utc::now()))],
                None,
            )
            .unwrap();
        let foreign_token = stored_lease(&store, "locks:a").unwrap().etag;

        thread::sleep(Duration::from_millis(1500));
        assert_eq!(handle.state(), LeaseState::Fenced);
        assert!(handle.is_lost());

        // No further writes from the fenced handle, not even on release.
        thread::sleep(Duration::from_millis(1200));
        handle.release();
        let after = stored_lease(&store, "locks:a");
        assert!(after.is_none() || after.unwrap().etag == foreign_token);
    }

    #[test]
    fn vanished_lease_is_reaped() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let handle = LockHandle::new(held_lease(&store, "locks:a", Some(2)), store.clone());

        store
            .delete(DocumentType::Lock, &DocumentId::from("locks:a"))
            .unwrap();

        thread::sleep(Duration::from_millis(1500));
        assert_eq!(handle.state(), LeaseState::Reaped);
    }

    #[test]
    fn transient_faults_do_not_stop_renewal() {
        let faulty = Arc::new(FaultyStore::new());
        let store: Arc<dyn DocumentStore> = faulty.clone();
        let handle = LockHandle::new(held_lease(&store, "locks:a", Some(4)), store.clone());

        faulty.fail_patches(1);
        // First heartbeat at 2s fails, second at 4s succeeds.
        thread::sleep(Duration::from_millis(4500));

        assert_eq!(handle.state(), LeaseState::Renewing);
        assert!(stored_lease(&store, "locks:a").is_some());
    }

    #[test]
    fn leases_without_ttl_are_not_renewed() {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let lease = held_lease(&store, "locks:a", None);
        let token = lease.etag.clone();
        let handle = LockHandle::new(lease, store.clone());

        thread::sleep(Duration::from_millis(1200));
        assert_eq!(handle.state(), LeaseState::Acquired);
        assert_eq!(stored_lease(&store, "locks:a").unwrap().etag, token);
    }
}
