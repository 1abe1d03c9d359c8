//! Folds raw counter documents into one aggregate per key.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use jobvault_core::{CounterType, Document, DocumentBody, DocumentId, DocumentType};

use super::{CancellationToken, ComponentError, ServerComponent};
use crate::storage::JobStorage;
use crate::store::{Filter, StoreError};

pub const AGGREGATOR_LOCK_KEY: &str = "locks:counters:aggregator";

#[derive(Debug, Default)]
struct Fold {
    total: i64,
    expire_on: Option<i64>,
    raw_ids: Vec<DocumentId>,
}

/// Periodic counter aggregation.
///
/// Each cycle reads up to `counters_aggregate_max_item_count` raw counters,
/// adds them to the aggregate counter of their key (creating it when needed,
/// keeping the latest expiry) and deletes the raw documents it folded.
#[derive(Debug)]
pub struct CountersAggregator {
    storage: JobStorage,
}

impl CountersAggregator {
    pub fn new(storage: JobStorage) -> Self {
        Self { storage }
    }

    /// One aggregation cycle. Returns the number of raw counters folded, or
    /// `None` when another server holds the aggregation lease.
    pub fn aggregate(&self, cancel: &CancellationToken) -> Result<Option<usize>, ComponentError> {
        let timeout = self.storage.options().counters_aggregate_interval;
        let folded = self
            .storage
            .lock_executor()
            .try_invoke(AGGREGATOR_LOCK_KEY, timeout, || self.fold_raw_counters(cancel))?;

        match folded {
            Some(result) => Ok(Some(result?)),
            None => {
                debug!(
                    key = AGGREGATOR_LOCK_KEY,
                    ?timeout,
                    "could not acquire the aggregation lease; counters were not aggregated"
                );
                Ok(None)
            }
        }
    }

    fn fold_raw_counters(&self, cancel: &CancellationToken) -> Result<usize, StoreError> {
        let store = self.storage.store();
        let limit = self.storage.options().counters_aggregate_max_item_count;

        let raw = store.query(
            DocumentType::Counter,
            &Filter::all()
                .with_counter_type(CounterType::Raw)
                .with_limit(limit),
        )?;

        let mut groups: BTreeMap<String, Fold> = BTreeMap::new();
        for doc in raw {
            if let DocumentBody::Counter { key, value, .. } = doc.body {
                let fold = groups.entry(key).or_default();
                fold.total += value;
                fold.expire_on = fold.expire_on.max(doc.expire_on);
                fold.raw_ids.push(doc.id);
            }
        }

        let mut folded = 0;
        for (key, fold) in groups {
            if cancel.is_cancelled() {
                break;
            }

            let existing = store
                .query(
                    DocumentType::Counter,
                    &Filter::by_key(&key).with_counter_type(CounterType::Aggregate),
                )?
                .into_iter()
                .next();

            let aggregate = match existing {
                Some(mut doc) => {
                    if let DocumentBody::Counter { value, .. } = &mut doc.body {
                        *value += fold.total;
                    }
                    doc.expire_on = doc.expire_on.max(fold.expire_on);
                    doc
                }
                None => Document::new(DocumentBody::Counter {
                    key: key.clone(),
                    value: fold.total,
                    counter_type: CounterType::Aggregate,
                })
                .expiring_on(fold.expire_on),
            };

            store.upsert(aggregate)?;
            let count = fold.raw_ids.len();
            store.delete_where(DocumentType::Counter, &Filter::by_ids(fold.raw_ids))?;

            trace!(key = %key, count, total = fold.total, "raw counters aggregated");
            folded += count;
        }

        Ok(folded)
    }
}

impl ServerComponent for CountersAggregator {
    fn name(&self) -> &str {
        "counters-aggregator"
    }

    fn execute(&self, cancel: &CancellationToken) -> Result<(), ComponentError> {
        if cancel.is_cancelled() {
            return Ok(());
        }
        self.aggregate(cancel)?;
        cancel.wait(self.storage.options().counters_aggregate_interval);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::store::{DocumentStore, InMemoryDocumentStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn storage(max_items: usize) -> JobStorage {
        let options = StorageOptions::default()
            .with_counters_aggregate_interval(Duration::from_millis(200))
            .with_counters_aggregate_max_item_count(max_items);
        JobStorage::new(Arc::new(InMemoryDocumentStore::new()), options).unwrap()
    }

    fn raw(storage: &JobStorage, key: &str, value: i64, expire_on: Option<i64>) {
        storage
            .store()
            .create(
                Document::new(DocumentBody::Counter {
                    key: key.to_string(),
                    value,
                    counter_type: CounterType::Raw,
                })
                .expiring_on(expire_on),
            )
            .unwrap();
    }

    fn counters(storage: &JobStorage, key: &str, counter_type: CounterType) -> Vec<Document> {
        storage
            .store()
            .query(
                DocumentType::Counter,
                &Filter::by_key(key).with_counter_type(counter_type),
            )
            .unwrap()
    }

    fn aggregate_value(storage: &JobStorage, key: &str) -> Option<(i64, Option<i64>)> {
        counters(storage, key, CounterType::Aggregate)
            .first()
            .and_then(|doc| match doc.body {
                DocumentBody::Counter { value, .. } => Some((value, doc.expire_on)),
                _ => None,
            })
    }

    #[test]
    fn raw_counters_fold_into_one_aggregate_per_key() {
        let storage = storage(100);
        raw(&storage, "succeeded", 1, None);
        raw(&storage, "succeeded", 1, Some(500));
        raw(&storage, "succeeded", -1, Some(900));
        raw(&storage, "failed", 1, None);

        let folded = CountersAggregator::new(storage.clone())
            .aggregate(&CancellationToken::new())
            .unwrap();

        assert_eq!(folded, Some(4));
        assert_eq!(aggregate_value(&storage, "succeeded"), Some((1, Some(900))));
        assert_eq!(aggregate_value(&storage, "failed"), Some((1, None)));
        assert!(counters(&storage, "succeeded", CounterType::Raw).is_empty());
    }

    #[test]
    fn later_cycles_add_to_the_existing_aggregate() {
        let storage = storage(100);
        let aggregator = CountersAggregator::new(storage.clone());

        raw(&storage, "succeeded", 1, None);
        aggregator.aggregate(&CancellationToken::new()).unwrap();
        raw(&storage, "succeeded", 1, None);
        raw(&storage, "succeeded", 1, None);
        aggregator.aggregate(&CancellationToken::new()).unwrap();

        assert_eq!(counters(&storage, "succeeded", CounterType::Aggregate).len(), 1);
        assert_eq!(aggregate_value(&storage, "succeeded"), Some((3, None)));
    }

    #[test]
    fn folds_at_most_the_configured_batch() {
        let storage = storage(2);
        for _ in 0..5 {
            raw(&storage, "succeeded", 1, None);
        }

        let folded = CountersAggregator::new(storage.clone())
            .aggregate(&CancellationToken::new())
            .unwrap();

        assert_eq!(folded, Some(2));
        assert_eq!(counters(&storage, "succeeded", CounterType::Raw).len(), 3);
        assert_eq!(aggregate_value(&storage, "succeeded"), Some((2, None)));
    }

    #[test]
    fn skips_when_another_server_aggregates() {
        let storage = storage(100);
        raw(&storage, "succeeded", 1, None);
        let _held = storage
            .acquire_distributed_lock(AGGREGATOR_LOCK_KEY, Duration::ZERO)
            .unwrap();

        let folded = CountersAggregator::new(storage.clone())
            .aggregate(&CancellationToken::new())
            .unwrap();

        assert_eq!(folded, None);
        assert_eq!(counters(&storage, "succeeded", CounterType::Raw).len(), 1);
    }
}
