//! Documents persisted in the shared store.
//!
//! Every document lives in exactly one partition, named by its
//! [`DocumentType`]. The store guarantees uniqueness of `(type, id)` and that
//! guarantee is what the lock layer builds mutual exclusion on.
//!
//! ## Common fields
//!
//! - `id`: unique within the partition
//! - `_etag`: opacity token, replaced by the store on every write
//! - `ttl`: store-side garbage collection in seconds since the last write
//! - `expire_on`: epoch second after which the expiration sweep may delete it

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{DocumentId, ETag};
use crate::time::{from_epoch, to_epoch};

/// Partition a document belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Lock,
    Job,
    State,
    Set,
    Hash,
    List,
    Counter,
    Queue,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::Lock => "lock",
            DocumentType::Job => "job",
            DocumentType::State => "state",
            DocumentType::Set => "set",
            DocumentType::Hash => "hash",
            DocumentType::List => "list",
            DocumentType::Counter => "counter",
            DocumentType::Queue => "queue",
        }
    }
}

impl core::fmt::Display for DocumentType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counter flavour.
///
/// Raw counters are one document per increment/decrement; the counter
/// aggregator folds them into one aggregate document per key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterType {
    Raw,
    Aggregate,
}

/// Serialized state payload (`name -> value`).
pub type StateData = BTreeMap<String, String>;

/// Category-specific document contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentBody {
    Lock {
        /// Epoch second of the last successful heartbeat.
        last_heartbeat: i64,
    },
    Job {
        invocation_data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_id: Option<DocumentId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_name: Option<String>,
        created_on: DateTime<Utc>,
    },
    State {
        job_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        created_on: DateTime<Utc>,
        #[serde(default)]
        data: StateData,
    },
    Set {
        key: String,
        value: String,
        score: f64,
        created_on: DateTime<Utc>,
    },
    Hash {
        key: String,
        field: String,
        value: String,
    },
    List {
        key: String,
        value: String,
        created_on: DateTime<Utc>,
    },
    Counter {
        key: String,
        value: i64,
        counter_type: CounterType,
    },
    Queue {
        name: String,
        job_id: String,
        created_on: DateTime<Utc>,
        /// Epoch second a worker last claimed or kept alive this entry.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fetched_at: Option<i64>,
    },
}

impl DocumentBody {
    pub fn document_type(&self) -> DocumentType {
        match self {
            DocumentBody::Lock { .. } => DocumentType::Lock,
            DocumentBody::Job { .. } => DocumentType::Job,
            DocumentBody::State { .. } => DocumentType::State,
            DocumentBody::Set { .. } => DocumentType::Set,
            DocumentBody::Hash { .. } => DocumentType::Hash,
            DocumentBody::List { .. } => DocumentType::List,
            DocumentBody::Counter { .. } => DocumentType::Counter,
            DocumentBody::Queue { .. } => DocumentType::Queue,
        }
    }

    /// The logical key grouping entries: the set/hash/list/counter key, or
    /// the queue name.
    pub fn key(&self) -> Option<&str> {
        match self {
            DocumentBody::Set { key, .. }
            | DocumentBody::Hash { key, .. }
            | DocumentBody::List { key, .. }
            | DocumentBody::Counter { key, .. } => Some(key),
            DocumentBody::Queue { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The user value carried by set/hash/list entries.
    pub fn value(&self) -> Option<&str> {
        match self {
            DocumentBody::Set { value, .. }
            | DocumentBody::Hash { value, .. }
            | DocumentBody::List { value, .. } => Some(value),
            _ => None,
        }
    }
}

/// A document as stored in (or submitted to) the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,

    #[serde(rename = "_etag", default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<ETag>,

    /// Store-side time-to-live in seconds, measured from the last write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expire_on: Option<i64>,

    #[serde(flatten)]
    pub body: DocumentBody,
}

impl Document {
    /// A fresh document with a generated id.
    pub fn new(body: DocumentBody) -> Self {
        Self::with_id(DocumentId::generate(), body)
    }

    pub fn with_id(id: DocumentId, body: DocumentBody) -> Self {
        Self {
            id,
            etag: None,
            ttl: None,
            expire_on: None,
            body,
        }
    }

    pub fn expiring_on(mut self, expire_on: Option<i64>) -> Self {
        self.expire_on = expire_on;
        self
    }

    pub fn document_type(&self) -> DocumentType {
        self.body.document_type()
    }

    /// Apply a single patch operation in place.
    ///
    /// Stores call this while holding whatever guard makes the patch atomic.
    pub fn apply_patch(&mut self, op: &PatchOperation) -> DomainResult<()> {
        match (op, &mut self.body) {
            (PatchOperation::SetHeartbeat(epoch), DocumentBody::Lock { last_heartbeat }) => {
                *last_heartbeat = *epoch;
            }
            (PatchOperation::SetHeartbeat(_), _) => {
                return Err(DomainError::unexpected_document(format!(
                    "heartbeat patch on a {} document",
                    self.document_type()
                )));
            }
            (PatchOperation::SetExpireOn(epoch), _) => self.expire_on = Some(*epoch),
            (PatchOperation::RemoveExpireOn, _) => self.expire_on = None,
            (
                PatchOperation::SetStatePointer {
                    state_id: new_id,
                    state_name: new_name,
                },
                DocumentBody::Job {
                    state_id,
                    state_name,
                    ..
                },
            ) => {
                *state_id = Some(new_id.clone());
                *state_name = Some(new_name.clone());
            }
            (PatchOperation::SetStatePointer { .. }, _) => {
                return Err(DomainError::unexpected_document(format!(
                    "state pointer patch on a {} document",
                    self.document_type()
                )));
            }
            (PatchOperation::SetFetchedAt(epoch), DocumentBody::Queue { fetched_at, .. }) => {
                *fetched_at = *epoch;
            }
            (PatchOperation::SetFetchedAt(_), _) => {
                return Err(DomainError::unexpected_document(format!(
                    "fetch patch on a {} document",
                    self.document_type()
                )));
            }
        }
        Ok(())
    }
}

/// A job state transition to be recorded as a `State` document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobState {
    pub name: String,
    pub reason: Option<String>,
    pub data: StateData,
}

impl JobState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            reason: None,
            data: StateData::new(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_data(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.data.insert(name.into(), value.into());
        self
    }

    /// The `State` document body recording this transition for `job_id`.
    pub fn to_body(&self, job_id: &str, created_on: DateTime<Utc>) -> DocumentBody {
        DocumentBody::State {
            job_id: job_id.to_string(),
            name: self.name.clone(),
            reason: self.reason.clone(),
            created_on,
            data: self.data.clone(),
        }
    }
}

/// Partial update understood by the store's conditional patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOperation {
    /// `/last_heartbeat = epoch` (lease documents only).
    SetHeartbeat(i64),
    /// `/expire_on = epoch`.
    SetExpireOn(i64),
    /// Remove `/expire_on`.
    RemoveExpireOn,
    /// `/state_id` and `/state_name` (job documents only).
    SetStatePointer {
        state_id: DocumentId,
        state_name: String,
    },
    /// `/fetched_at` (queue documents only); `None` hands the entry back.
    SetFetchedAt(Option<i64>),
}

/// Exclusive ownership of a named resource.
///
/// A lease is **live** while `now - last_heartbeat < time_to_live`. The id is
/// the resource key, so the store's create-if-absent on `(lock, id)` is the
/// atomic acquire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub id: DocumentId,
    pub last_heartbeat: DateTime<Utc>,
    /// Seconds; `None` means the store never reclaims it on its own.
    pub time_to_live: Option<u64>,
    pub etag: Option<ETag>,
}

impl Lease {
    pub fn new(id: DocumentId, now: DateTime<Utc>, time_to_live: Option<u64>) -> Self {
        Self {
            id,
            last_heartbeat: now,
            time_to_live,
            etag: None,
        }
    }

    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        match self.time_to_live {
            Some(ttl) => (now - self.last_heartbeat).num_seconds() < ttl as i64,
            None => true,
        }
    }

    pub fn into_document(self) -> Document {
        Document {
            id: self.id,
            etag: self.etag,
            ttl: self.time_to_live,
            expire_on: None,
            body: DocumentBody::Lock {
                last_heartbeat: to_epoch(self.last_heartbeat),
            },
        }
    }
}

impl TryFrom<Document> for Lease {
    type Error = DomainError;

    fn try_from(doc: Document) -> Result<Self, Self::Error> {
        let DocumentBody::Lock { last_heartbeat } = doc.body else {
            return Err(DomainError::unexpected_document(format!(
                "expected a lock document, found {}",
                doc.body.document_type()
            )));
        };

        let last_heartbeat = from_epoch(last_heartbeat).ok_or_else(|| {
            DomainError::unexpected_document(format!("heartbeat {last_heartbeat} out of range"))
        })?;

        Ok(Self {
            id: doc.id,
            last_heartbeat,
            time_to_live: doc.ttl,
            etag: doc.etag,
        })
    }
}
