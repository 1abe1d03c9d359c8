//! Write-only transaction.
//!
//! Every mutation is validated when it is called and queued as a command; no
//! store I/O happens until [`WriteOnlyTransaction::commit`]. A commit runs the
//! whole batch, in call order, while holding the global commit lease. When
//! that lease cannot be acquired the entire batch is retried, so every command
//! must reach the same end state when it runs more than once:
//!
//! - documents that a command creates get their id (and timestamps) when the
//!   command is queued, and are written with `upsert`
//! - expiry epochs are computed when the command is queued
//! - set and hash writes reconcile against what is already stored
//!
//! Expire and persist commands act on the entries present when they run, so a
//! batch that expires a key and then adds to it is not replay-stable: on
//! replay the expiry also reaches the entries the first run added.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, warn};

use jobvault_core::error::require_non_blank;
use jobvault_core::time::{epoch_after, try_parse_to_epoch};
use jobvault_core::{
    CounterType, Document, DocumentBody, DocumentId, DocumentType, DomainError, JobState,
    PatchOperation,
};

use crate::lock::LockError;
use crate::queue::QueueEntry;
use crate::storage::JobStorage;
use crate::store::{Filter, StoreError};

/// Serialises every commit across all processes sharing the store.
pub const COMMIT_LOCK_KEY: &str = "locks:batch:commit";

/// Guards read-modify-write sequences on job documents.
pub const JOB_UPDATE_LOCK_KEY: &str = "locks:job:update";

/// First attempt plus three retries.
const MAX_LEASE_ATTEMPTS: u32 = 4;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error(transparent)]
    Validation(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

/// How a commit ended.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every queued command ran.
    Committed { attempts: u32 },
    /// The commit lease was never acquired; no command ran.
    AbandonedAfterRetries { attempts: u32 },
}

impl CommitOutcome {
    pub fn is_committed(self) -> bool {
        matches!(self, CommitOutcome::Committed { .. })
    }

    pub fn attempts(self) -> u32 {
        match self {
            CommitOutcome::Committed { attempts }
            | CommitOutcome::AbandonedAfterRetries { attempts } => attempts,
        }
    }
}

type Command = Box<dyn Fn(&JobStorage) -> Result<(), TransactionError> + Send + Sync>;

enum Leased {
    Done { attempts: u32 },
    Exhausted,
}

/// Run `action` under `key`, retrying the acquire when it times out.
fn under_lease(
    storage: &JobStorage,
    key: &str,
    action: impl Fn() -> Result<(), TransactionError>,
) -> Result<Leased, TransactionError> {
    let timeout = storage.options().transactional_lock_timeout;

    for attempt in 1..=MAX_LEASE_ATTEMPTS {
        match storage.lock_executor().invoke(key, timeout, &action) {
            Ok(result) => return result.map(|()| Leased::Done { attempts: attempt }),
            Err(e) if e.is_timeout_for(key) => {
                debug!(key, attempt, "lease not acquired");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Leased::Exhausted)
}

/// Job-document update under the job-update lease. Gives up with a warning
/// when the lease stays busy.
fn update_job(
    storage: &JobStorage,
    job_id: &str,
    action: impl Fn() -> Result<(), TransactionError>,
) -> Result<(), TransactionError> {
    if let Leased::Exhausted = under_lease(storage, JOB_UPDATE_LOCK_KEY, action)? {
        warn!(
            job_id,
            key = JOB_UPDATE_LOCK_KEY,
            attempts = MAX_LEASE_ATTEMPTS,
            "job update skipped: lease not acquired"
        );
    }
    Ok(())
}

fn created_on(doc: &Document) -> Option<DateTime<Utc>> {
    match &doc.body {
        DocumentBody::List { created_on, .. } | DocumentBody::Set { created_on, .. } => {
            Some(*created_on)
        }
        _ => None,
    }
}

fn with_score(mut doc: Document, new_score: f64) -> Document {
    if let DocumentBody::Set { score, .. } = &mut doc.body {
        *score = new_score;
    }
    doc
}

fn with_hash_value(mut doc: Document, new_value: &str) -> Document {
    if let DocumentBody::Hash { value, .. } = &mut doc.body {
        *value = new_value.to_string();
    }
    doc
}

/// Unicode case-insensitive equality, without allocating.
fn same_ignoring_case(a: &str, b: &str) -> bool {
    a == b
        || a.chars()
            .flat_map(char::to_lowercase)
            .eq(b.chars().flat_map(char::to_lowercase))
}

/// Batch of deferred mutations, executed by [`commit`](Self::commit).
pub struct WriteOnlyTransaction {
    storage: JobStorage,
    commands: Vec<Command>,
}

impl WriteOnlyTransaction {
    pub fn new(storage: JobStorage) -> Self {
        Self {
            storage,
            commands: Vec::new(),
        }
    }

    /// Number of queued commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn push(
        &mut self,
        command: impl Fn(&JobStorage) -> Result<(), TransactionError> + Send + Sync + 'static,
    ) {
        self.commands.push(Box::new(command));
    }

    /// Run every queued command under the commit lease.
    ///
    /// A timeout on the commit lease retries the whole batch up to three
    /// more times; after that the commit is abandoned without running
    /// anything. A store fault in a command stops the batch and is returned;
    /// commands that already ran stay applied.
    pub fn commit(&self) -> Result<CommitOutcome, TransactionError> {
        let storage = &self.storage;
        let outcome = under_lease(storage, COMMIT_LOCK_KEY, || {
            for command in &self.commands {
                command(storage)?;
            }
            Ok(())
        })?;

        match outcome {
            Leased::Done { attempts } => {
                debug!(commands = self.commands.len(), attempts, "transaction committed");
                Ok(CommitOutcome::Committed { attempts })
            }
            Leased::Exhausted => {
                warn!(
                    key = COMMIT_LOCK_KEY,
                    commands = self.commands.len(),
                    attempts = MAX_LEASE_ATTEMPTS,
                    "transaction abandoned: commit lease not acquired"
                );
                Ok(CommitOutcome::AbandonedAfterRetries {
                    attempts: MAX_LEASE_ATTEMPTS,
                })
            }
        }
    }

    // ---- queue ----

    pub fn add_to_queue(&mut self, queue: &str, job_id: &str) -> Result<(), TransactionError> {
        require_non_blank("queue", queue)?;
        require_non_blank("job_id", job_id)?;

        let entry = QueueEntry::new(queue, job_id);
        self.push(move |s| Ok(s.queue().enqueue(&entry)?));
        Ok(())
    }

    // ---- counters ----

    pub fn increment_counter(&mut self, key: &str) -> Result<(), TransactionError> {
        self.add_raw_counter(key, 1, None)
    }

    pub fn increment_counter_with_expiry(
        &mut self,
        key: &str,
        expire_in: Duration,
    ) -> Result<(), TransactionError> {
        let epoch = epoch_after(Utc::now(), expire_in)?;
        self.add_raw_counter(key, 1, Some(epoch))
    }

    pub fn decrement_counter(&mut self, key: &str) -> Result<(), TransactionError> {
        self.add_raw_counter(key, -1, None)
    }

    pub fn decrement_counter_with_expiry(
        &mut self,
        key: &str,
        expire_in: Duration,
    ) -> Result<(), TransactionError> {
        let epoch = epoch_after(Utc::now(), expire_in)?;
        self.add_raw_counter(key, -1, Some(epoch))
    }

    fn add_raw_counter(
        &mut self,
        key: &str,
        value: i64,
        expire_on: Option<i64>,
    ) -> Result<(), TransactionError> {
        require_non_blank("key", key)?;

        let doc = Document::new(DocumentBody::Counter {
            key: key.to_string(),
            value,
            counter_type: CounterType::Raw,
        })
        .expiring_on(expire_on);

        self.push(move |s| {
            s.store().upsert(doc.clone())?;
            Ok(())
        });
        Ok(())
    }

    // ---- jobs ----

    /// Expire the job and, separately, every state recorded for it.
    pub fn expire_job(&mut self, job_id: &str, expire_in: Duration) -> Result<(), TransactionError> {
        require_non_blank("job_id", job_id)?;
        let epoch = epoch_after(Utc::now(), expire_in)?;

        let id = job_id.to_string();
        self.push(move |s| {
            update_job(s, &id, || {
                s.store()
                    .expire_where(DocumentType::Job, &Filter::by_id(id.as_str()), epoch)?;
                Ok(())
            })
        });

        let id = job_id.to_string();
        self.push(move |s| {
            s.store()
                .expire_where(DocumentType::State, &Filter::by_job_id(&id), epoch)?;
            Ok(())
        });
        Ok(())
    }

    pub fn persist_job(&mut self, job_id: &str) -> Result<(), TransactionError> {
        require_non_blank("job_id", job_id)?;

        let id = job_id.to_string();
        self.push(move |s| {
            update_job(s, &id, || {
                s.store()
                    .persist_where(DocumentType::Job, &Filter::by_id(id.as_str()))?;
                Ok(())
            })
        });
        Ok(())
    }

    /// Record `state` and point the job at it.
    pub fn set_job_state(&mut self, job_id: &str, state: &JobState) -> Result<(), TransactionError> {
        require_non_blank("job_id", job_id)?;
        require_non_blank("state.name", &state.name)?;

        let id = DocumentId::from(job_id);
        let state_doc = Document::new(state.to_body(job_id, Utc::now()));
        let pointer = [PatchOperation::SetStatePointer {
            state_id: state_doc.id.clone(),
            state_name: state.name.clone(),
        }];

        self.push(move |s| {
            update_job(s, id.as_str(), || {
                s.store().upsert(state_doc.clone())?;
                s.store().patch(DocumentType::Job, &id, &pointer, None)?;
                Ok(())
            })
        });
        Ok(())
    }

    /// Record `state` in the job's history without changing its current state.
    pub fn add_job_state(&mut self, job_id: &str, state: &JobState) -> Result<(), TransactionError> {
        require_non_blank("job_id", job_id)?;
        require_non_blank("state.name", &state.name)?;

        let state_doc = Document::new(state.to_body(job_id, Utc::now()));
        self.push(move |s| {
            s.store().upsert(state_doc.clone())?;
            Ok(())
        });
        Ok(())
    }

    // ---- sets ----

    pub fn add_to_set(&mut self, key: &str, value: &str) -> Result<(), TransactionError> {
        self.add_to_set_with_score(key, value, 0.0)
    }

    /// Add `value` under `key`, or move an existing entry to `score`.
    pub fn add_to_set_with_score(
        &mut self,
        key: &str,
        value: &str,
        score: f64,
    ) -> Result<(), TransactionError> {
        require_non_blank("key", key)?;
        require_non_blank("value", value)?;
        if score.is_nan() {
            return Err(DomainError::validation("`score` must be a number").into());
        }

        let (key, value) = (key.to_string(), value.to_string());
        self.push(move |s| {
            let store = s.store();
            let existing = store.query(DocumentType::Set, &Filter::by_key(&key).with_value(&value))?;

            if existing.is_empty() {
                store.upsert(Document::new(DocumentBody::Set {
                    key: key.clone(),
                    value: value.clone(),
                    score,
                    created_on: Utc::now(),
                }))?;
            } else {
                for doc in existing {
                    store.upsert(with_score(doc, score))?;
                }
            }
            Ok(())
        });
        Ok(())
    }

    pub fn remove_from_set(&mut self, key: &str, value: &str) -> Result<(), TransactionError> {
        require_non_blank("key", key)?;
        require_non_blank("value", value)?;

        let (key, value) = (key.to_string(), value.to_string());
        self.push(move |s| {
            s.store()
                .delete_where(DocumentType::Set, &Filter::by_key(&key).with_value(&value))?;
            Ok(())
        });
        Ok(())
    }

    /// Add every value not yet present under `key`, with score 0. Existing
    /// entries keep their score.
    pub fn add_range_to_set<I, V>(&mut self, key: &str, items: I) -> Result<(), TransactionError>
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        require_non_blank("key", key)?;

        let mut seen = HashSet::new();
        let mut values = Vec::new();
        for item in items {
            let item = item.into();
            require_non_blank("items", &item)?;
            if seen.insert(item.clone()) {
                values.push(item);
            }
        }

        let key = key.to_string();
        self.push(move |s| {
            let store = s.store();
            let present: HashSet<String> = store
                .query(DocumentType::Set, &Filter::by_key(&key))?
                .iter()
                .filter_map(|doc| doc.body.value().map(str::to_string))
                .collect();

            for value in values.iter().filter(|v| !present.contains(*v)) {
                store.upsert(Document::new(DocumentBody::Set {
                    key: key.clone(),
                    value: value.clone(),
                    score: 0.0,
                    created_on: Utc::now(),
                }))?;
            }
            Ok(())
        });
        Ok(())
    }

    pub fn remove_set(&mut self, key: &str) -> Result<(), TransactionError> {
        self.remove_key(DocumentType::Set, key)
    }

    pub fn expire_set(&mut self, key: &str, expire_in: Duration) -> Result<(), TransactionError> {
        self.expire_key(DocumentType::Set, key, expire_in)
    }

    pub fn persist_set(&mut self, key: &str) -> Result<(), TransactionError> {
        self.persist_key(DocumentType::Set, key)
    }

    // ---- hashes ----

    /// Write `field = value` pairs under `key`.
    ///
    /// Values that parse as RFC 3339 timestamps are stored as epoch seconds.
    /// A field stored more than once collapses to a single document. A value
    /// that only differs by case is left as stored.
    pub fn set_range_in_hash<I, F, V>(&mut self, key: &str, pairs: I) -> Result<(), TransactionError>
    where
        I: IntoIterator<Item = (F, V)>,
        F: Into<String>,
        V: Into<String>,
    {
        require_non_blank("key", key)?;

        // Last write per field wins.
        let mut fields = BTreeMap::new();
        for (field, value) in pairs {
            let field = field.into();
            require_non_blank("field", &field)?;
            let value: String = value.into();
            fields.insert(field, try_parse_to_epoch(&value));
        }

        let key = key.to_string();
        self.push(move |s| {
            let store = s.store();
            let stored = store.query(DocumentType::Hash, &Filter::by_key(&key))?;
            let mut writes = Vec::new();

            for (field, value) in &fields {
                let mut matching = stored.iter().filter(|doc| {
                    matches!(&doc.body, DocumentBody::Hash { field: f, .. } if f == field)
                });

                match (matching.next(), matching.next()) {
                    (Some(kept), Some(_)) => {
                        store.delete_where(
                            DocumentType::Hash,
                            &Filter::by_key(&key)
                                .with_field(field)
                                .excluding(kept.id.clone()),
                        )?;
                        writes.push(with_hash_value(kept.clone(), value));
                    }
                    (Some(only), None) => {
                        let unchanged = only
                            .body
                            .value()
                            .is_some_and(|current| same_ignoring_case(current, value));
                        if !unchanged {
                            writes.push(with_hash_value(only.clone(), value));
                        }
                    }
                    _ => writes.push(Document::new(DocumentBody::Hash {
                        key: key.clone(),
                        field: field.clone(),
                        value: value.clone(),
                    })),
                }
            }

            for doc in writes {
                store.upsert(doc)?;
            }
            Ok(())
        });
        Ok(())
    }

    pub fn remove_hash(&mut self, key: &str) -> Result<(), TransactionError> {
        self.remove_key(DocumentType::Hash, key)
    }

    pub fn expire_hash(&mut self, key: &str, expire_in: Duration) -> Result<(), TransactionError> {
        self.expire_key(DocumentType::Hash, key, expire_in)
    }

    pub fn persist_hash(&mut self, key: &str) -> Result<(), TransactionError> {
        self.persist_key(DocumentType::Hash, key)
    }

    // ---- lists ----

    pub fn insert_to_list(&mut self, key: &str, value: &str) -> Result<(), TransactionError> {
        require_non_blank("key", key)?;
        require_non_blank("value", value)?;

        let doc = Document::new(DocumentBody::List {
            key: key.to_string(),
            value: value.to_string(),
            created_on: Utc::now(),
        });
        self.push(move |s| {
            s.store().upsert(doc.clone())?;
            Ok(())
        });
        Ok(())
    }

    pub fn remove_from_list(&mut self, key: &str, value: &str) -> Result<(), TransactionError> {
        require_non_blank("key", key)?;
        require_non_blank("value", value)?;

        let (key, value) = (key.to_string(), value.to_string());
        self.push(move |s| {
            s.store()
                .delete_where(DocumentType::List, &Filter::by_key(&key).with_value(&value))?;
            Ok(())
        });
        Ok(())
    }

    /// Keep the entries at positions `keep_starting_from..=keep_ending_at`,
    /// newest first, and delete the rest.
    pub fn trim_list(
        &mut self,
        key: &str,
        keep_starting_from: usize,
        keep_ending_at: usize,
    ) -> Result<(), TransactionError> {
        require_non_blank("key", key)?;

        let key = key.to_string();
        self.push(move |s| {
            let mut entries = s.store().query(DocumentType::List, &Filter::by_key(&key))?;
            // Newest insertion first, so equal timestamps keep the later entry.
            entries.reverse();
            entries.sort_by(|a, b| created_on(b).cmp(&created_on(a)));

            let outside: Vec<DocumentId> = entries
                .into_iter()
                .enumerate()
                .filter(|(index, _)| *index < keep_starting_from || *index > keep_ending_at)
                .map(|(_, doc)| doc.id)
                .collect();

            if !outside.is_empty() {
                s.store()
                    .delete_where(DocumentType::List, &Filter::by_ids(outside))?;
            }
            Ok(())
        });
        Ok(())
    }

    pub fn expire_list(&mut self, key: &str, expire_in: Duration) -> Result<(), TransactionError> {
        self.expire_key(DocumentType::List, key, expire_in)
    }

    pub fn persist_list(&mut self, key: &str) -> Result<(), TransactionError> {
        self.persist_key(DocumentType::List, key)
    }

    // ---- whole-key helpers ----

    fn remove_key(&mut self, document_type: DocumentType, key: &str) -> Result<(), TransactionError> {
        require_non_blank("key", key)?;

        let key = key.to_string();
        self.push(move |s| {
            s.store().delete_where(document_type, &Filter::by_key(&key))?;
            Ok(())
        });
        Ok(())
    }

    fn expire_key(
        &mut self,
        document_type: DocumentType,
        key: &str,
        expire_in: Duration,
    ) -> Result<(), TransactionError> {
        require_non_blank("key", key)?;
        let epoch = epoch_after(Utc::now(), expire_in)?;

        let key = key.to_string();
        self.push(move |s| {
            s.store()
                .expire_where(document_type, &Filter::by_key(&key), epoch)?;
            Ok(())
        });
        Ok(())
    }

    fn persist_key(&mut self, document_type: DocumentType, key: &str) -> Result<(), TransactionError> {
        require_non_blank("key", key)?;

        let key = key.to_string();
        self.push(move |s| {
            s.store().persist_where(document_type, &Filter::by_key(&key))?;
            Ok(())
        });
        Ok(())
    }
}

impl core::fmt::Debug for WriteOnlyTransaction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WriteOnlyTransaction")
            .field("commands", &self.commands.len())
            .finish_non_exhaustive()
    }
}
