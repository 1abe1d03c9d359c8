//! Expiration sweep.

use tracing::{debug, trace};

use jobvault_core::time::now_epoch;
use jobvault_core::{CounterType, DocumentType};

use super::{CancellationToken, ComponentError, ServerComponent};
use crate::storage::JobStorage;
use crate::store::{Filter, StoreError};

pub const EXPIRATION_LOCK_KEY: &str = "locks:expiration:manager";

/// Categories swept, in order.
const SWEPT: [DocumentType; 6] = [
    DocumentType::Job,
    DocumentType::List,
    DocumentType::Set,
    DocumentType::Hash,
    DocumentType::Counter,
    DocumentType::State,
];

/// Result of one sweep.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SweepOutcome {
    /// The sweep ran; documents deleted across all categories.
    Swept { deleted: usize },
    /// Cancelled before every category was visited.
    Cancelled { deleted: usize },
    /// Another server holds the sweep lease.
    Skipped,
}

/// Deletes documents whose `expire_on` has passed.
///
/// Raw counters are left to the counter aggregator; only aggregate counters
/// expire here.
#[derive(Debug)]
pub struct ExpirationManager {
    storage: JobStorage,
}

impl ExpirationManager {
    pub fn new(storage: JobStorage) -> Self {
        Self { storage }
    }

    /// One sweep under the expiration lease, without the trailing wait.
    pub fn sweep(&self, cancel: &CancellationToken) -> Result<SweepOutcome, ComponentError> {
        let now = now_epoch();
        let timeout = self.storage.options().expiration_check_interval;

        let swept = self
            .storage
            .lock_executor()
            .try_invoke(EXPIRATION_LOCK_KEY, timeout, || self.remove_expired(now, cancel))?;

        match swept {
            Some(outcome) => Ok(outcome?),
            None => {
                debug!(
                    key = EXPIRATION_LOCK_KEY,
                    ?timeout,
                    "could not acquire the expiration lease; outdated records were not removed"
                );
                Ok(SweepOutcome::Skipped)
            }
        }
    }

    fn remove_expired(&self, now: i64, cancel: &CancellationToken) -> Result<SweepOutcome, StoreError> {
        let mut deleted = 0;

        for document_type in SWEPT {
            if cancel.is_cancelled() {
                return Ok(SweepOutcome::Cancelled { deleted });
            }

            trace!(%document_type, "removing outdated records");

            let mut filter = Filter::expired_before(now);
            if document_type == DocumentType::Counter {
                filter = filter.with_counter_type(CounterType::Aggregate);
            }

            let removed = self.storage.store().delete_where(document_type, &filter)?;
            trace!(%document_type, removed, "outdated records removed");
            deleted += removed;
        }

        Ok(SweepOutcome::Swept { deleted })
    }
}

impl ServerComponent for ExpirationManager {
    fn name(&self) -> &str {
        "expiration-manager"
    }

    fn execute(&self, cancel: &CancellationToken) -> Result<(), ComponentError> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.sweep(cancel)?;
        cancel.wait(self.storage.options().expiration_check_interval);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::store::{DocumentStore, InMemoryDocumentStore};
    use crate::testing::FaultyStore;
    use chrono::Utc;
    use jobvault_core::{Document, DocumentBody};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn storage() -> JobStorage {
        let options = StorageOptions::default().with_expiration_check_interval(Duration::from_millis(200));
        JobStorage::new(Arc::new(InMemoryDocumentStore::new()), options).unwrap()
    }

    fn put(storage: &JobStorage, body: DocumentBody, expire_on: Option<i64>) -> Document {
        storage
            .store()
            .create(Document::new(body).expiring_on(expire_on))
            .unwrap()
    }

    fn counter(counter_type: CounterType) -> DocumentBody {
        DocumentBody::Counter {
            key: "stats:succeeded".to_string(),
            value: 1,
            counter_type,
        }
    }

    fn list(value: &str) -> DocumentBody {
        DocumentBody::List {
            key: "l".to_string(),
            value: value.to_string(),
            created_on: Utc::now(),
        }
    }

    fn exists(storage: &JobStorage, doc: &Document) -> bool {
        storage
            .store()
            .read(doc.document_type(), &doc.id)
            .unwrap()
            .is_some()
    }

    #[test]
    fn deletes_only_documents_past_their_expiry() {
        let storage = storage();
        let past = now_epoch() - 10;
        let expired = put(&storage, list("old"), Some(past));
        let future = put(&storage, list("new"), Some(now_epoch() + 3600));
        let forever = put(&storage, list("kept"), None);
        let state = put(
            &storage,
            DocumentBody::State {
                job_id: "job-1".to_string(),
                name: "Succeeded".to_string(),
                reason: None,
                created_on: Utc::now(),
                data: Default::default(),
            },
            Some(past),
        );

        let outcome = ExpirationManager::new(storage.clone())
            .sweep(&CancellationToken::new())
            .unwrap();

        assert_eq!(outcome, SweepOutcome::Swept { deleted: 2 });
        assert!(!exists(&storage, &expired));
        assert!(!exists(&storage, &state));
        assert!(exists(&storage, &future));
        assert!(exists(&storage, &forever));
    }

    #[test]
    fn raw_counters_are_left_for_the_aggregator() {
        let storage = storage();
        let past = now_epoch() - 10;
        let aggregate = put(&storage, counter(CounterType::Aggregate), Some(past));
        let raw = put(&storage, counter(CounterType::Raw), Some(past));

        ExpirationManager::new(storage.clone())
            .sweep(&CancellationToken::new())
            .unwrap();

        assert!(!exists(&storage, &aggregate));
        assert!(exists(&storage, &raw));
    }

    #[test]
    fn skips_the_cycle_when_another_server_sweeps() {
        let storage = storage();
        let expired = put(&storage, list("old"), Some(now_epoch() - 10));
        let _held = storage
            .acquire_distributed_lock(EXPIRATION_LOCK_KEY, Duration::ZERO)
            .unwrap();

        let outcome = ExpirationManager::new(storage.clone())
            .sweep(&CancellationToken::new())
            .unwrap();

        assert_eq!(outcome, SweepOutcome::Skipped);
        assert!(exists(&storage, &expired));
    }

    #[test]
    fn cancelled_sweep_touches_nothing() {
        let storage = storage();
        let expired = put(&storage, list("old"), Some(now_epoch() - 10));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = ExpirationManager::new(storage.clone()).sweep(&cancel).unwrap();

        assert_eq!(outcome, SweepOutcome::Cancelled { deleted: 0 });
        assert!(exists(&storage, &expired));
    }

    #[test]
    fn cancellation_mid_sweep_stops_before_the_next_category() {
        let store = Arc::new(FaultyStore::new());
        let options = StorageOptions::default().with_expiration_check_interval(Duration::from_millis(200));
        let storage = JobStorage::new(store.clone(), options).unwrap();
        let past = now_epoch() - 10;
        let job = |n: u8| DocumentBody::Job {
            invocation_data: format!("{{\"n\":{n}}}"),
            state_id: None,
            state_name: None,
            created_on: Utc::now(),
        };
        let jobs = [put(&storage, job(1), Some(past)), put(&storage, job(2), Some(past))];
        let expired_list = put(&storage, list("old"), Some(past));

        let cancel = CancellationToken::new();
        store.cancel_on_delete(DocumentType::Job, cancel.clone());

        let outcome = ExpirationManager::new(storage.clone()).sweep(&cancel).unwrap();

        // The category in progress is finished, the rest are not visited.
        assert_eq!(outcome, SweepOutcome::Cancelled { deleted: 2 });
        assert!(jobs.iter().all(|job| !exists(&storage, job)));
        assert!(exists(&storage, &expired_list));
        // The lease is still released.
        assert!(storage
            .acquire_distributed_lock(EXPIRATION_LOCK_KEY, Duration::ZERO)
            .is_ok());
    }

    #[test]
    fn execute_waits_the_interval_and_releases_the_lease() {
        let storage = storage();
        let manager = ExpirationManager::new(storage.clone());

        let started = Instant::now();
        manager.execute(&CancellationToken::new()).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));

        assert!(storage
            .acquire_distributed_lock(EXPIRATION_LOCK_KEY, Duration::ZERO)
            .is_ok());
    }
}
