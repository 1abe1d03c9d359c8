//! Query filter understood by every [`DocumentStore`](super::DocumentStore).
//!
//! A filter is a conjunction of optional predicates. All predicates are part
//! of the store contract: a backend that cannot evaluate one of them natively
//! (equality on JSON-valued `value` fields is the usual offender) narrows the
//! candidate set with the rest and finishes with [`Filter::matches`].

use jobvault_core::{CounterType, Document, DocumentBody, DocumentId};

/// Filter criteria for partition queries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Restrict to these ids (optional).
    pub ids: Option<Vec<DocumentId>>,
    /// Exclude this id (optional).
    pub exclude_id: Option<DocumentId>,
    /// Set/hash/list/counter key (optional).
    pub key: Option<String>,
    /// Exact entry value (optional).
    pub value: Option<String>,
    /// Hash field (optional).
    pub field: Option<String>,
    /// Owning job of state documents (optional).
    pub job_id: Option<String>,
    /// Only documents with a defined `expire_on` strictly before this epoch.
    pub expired_before: Option<i64>,
    /// Counter flavour (optional).
    pub counter_type: Option<CounterType>,
    /// Maximum number of documents returned (optional).
    pub limit: Option<usize>,
}

impl Filter {
    /// Match every document in the partition.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_id(id: impl Into<DocumentId>) -> Self {
        Self {
            ids: Some(vec![id.into()]),
            ..Default::default()
        }
    }

    pub fn by_ids(ids: Vec<DocumentId>) -> Self {
        Self {
            ids: Some(ids),
            ..Default::default()
        }
    }

    pub fn by_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn by_job_id(job_id: impl Into<String>) -> Self {
        Self {
            job_id: Some(job_id.into()),
            ..Default::default()
        }
    }

    pub fn expired_before(epoch: i64) -> Self {
        Self {
            expired_before: Some(epoch),
            ..Default::default()
        }
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn excluding(mut self, id: DocumentId) -> Self {
        self.exclude_id = Some(id);
        self
    }

    pub fn with_counter_type(mut self, counter_type: CounterType) -> Self {
        self.counter_type = Some(counter_type);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Evaluate every predicate except `limit` against one document.
    pub fn matches(&self, doc: &Document) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.contains(&doc.id) {
                return false;
            }
        }

        if self.exclude_id.as_ref() == Some(&doc.id) {
            return false;
        }

        if let Some(key) = &self.key {
            if doc.body.key() != Some(key.as_str()) {
                return false;
            }
        }

        if let Some(value) = &self.value {
            if doc.body.value() != Some(value.as_str()) {
                return false;
            }
        }

        if let Some(field) = &self.field {
            match &doc.body {
                DocumentBody::Hash { field: f, .. } if f == field => {}
                _ => return false,
            }
        }

        if let Some(job_id) = &self.job_id {
            match &doc.body {
                DocumentBody::State { job_id: j, .. } if j == job_id => {}
                _ => return false,
            }
        }

        if let Some(epoch) = self.expired_before {
            match doc.expire_on {
                Some(expire_on) if expire_on < epoch => {}
                _ => return false,
            }
        }

        if let Some(counter_type) = self.counter_type {
            match &doc.body {
                DocumentBody::Counter { counter_type: t, .. } if *t == counter_type => {}
                _ => return false,
            }
        }

        true
    }
}
