use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use jobvault_core::{Document, DocumentId, DocumentType, ETag, PatchOperation};

use super::query::Filter;
use super::r#trait::{DocumentStore, StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DocumentKey {
    document_type: DocumentType,
    id: DocumentId,
}

#[derive(Debug, Clone)]
struct Entry {
    doc: Document,
    written_at: DateTime<Utc>,
    /// Insertion order, so queries are stable.
    seq: u64,
}

impl Entry {
    fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        match self.doc.ttl {
            Some(ttl) => (now - self.written_at).num_milliseconds() < ttl as i64 * 1000,
            None => true,
        }
    }
}

#[derive(Debug, Default)]
struct Partitions {
    docs: HashMap<DocumentKey, Entry>,
    next_seq: u64,
}

/// In-memory document store.
///
/// Intended for tests/dev and the demo host. Honours the full contract,
/// including opacity tokens and TTL (expired documents are reaped lazily on
/// the next access).
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    inner: RwLock<Partitions>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("lock poisoned".to_string())
    }

    fn key(document_type: DocumentType, id: &DocumentId) -> DocumentKey {
        DocumentKey {
            document_type,
            id: id.clone(),
        }
    }

    /// Drop `key` if its TTL has lapsed; returns whether a live entry remains.
    fn reap_if_expired(partitions: &mut Partitions, key: &DocumentKey, now: DateTime<Utc>) -> bool {
        match partitions.docs.get(key) {
            Some(entry) if entry.is_live_at(now) => true,
            Some(_) => {
                partitions.docs.remove(key);
                false
            }
            None => false,
        }
    }

    fn stamp(mut doc: Document) -> Document {
        doc.etag = Some(ETag::generate());
        doc
    }
}

impl DocumentStore for InMemoryDocumentStore {
    fn create(&self, doc: Document) -> StoreResult<Document> {
        let key = Self::key(doc.document_type(), &doc.id);
        let now = Utc::now();

        let mut partitions = self.inner.write().map_err(|_| Self::poisoned())?;
        if Self::reap_if_expired(&mut partitions, &key, now) {
            return Err(StoreError::Conflict(format!("{}/{}", key.document_type, key.id)));
        }

        let stored = Self::stamp(doc);
        let seq = partitions.next_seq;
        partitions.next_seq += 1;
        partitions.docs.insert(
            key,
            Entry {
                doc: stored.clone(),
                written_at: now,
                seq,
            },
        );
        Ok(stored)
    }

    fn read(&self, document_type: DocumentType, id: &DocumentId) -> StoreResult<Option<Document>> {
        let now = Utc::now();
        let partitions = self.inner.read().map_err(|_| Self::poisoned())?;
        Ok(partitions
            .docs
            .get(&Self::key(document_type, id))
            .filter(|e| e.is_live_at(now))
            .map(|e| e.doc.clone()))
    }

    fn upsert(&self, doc: Document) -> StoreResult<Document> {
        let key = Self::key(doc.document_type(), &doc.id);
        let now = Utc::now();

        let mut partitions = self.inner.write().map_err(|_| Self::poisoned())?;
        let live = Self::reap_if_expired(&mut partitions, &key, now);
        let seq = match partitions.docs.get(&key) {
            Some(existing) if live => existing.seq,
            _ => {
                let seq = partitions.next_seq;
                partitions.next_seq += 1;
                seq
            }
        };

        let stored = Self::stamp(doc);
        partitions.docs.insert(
            key,
            Entry {
                doc: stored.clone(),
                written_at: now,
                seq,
            },
        );
        Ok(stored)
    }

    fn patch(
        &self,
        document_type: DocumentType,
        id: &DocumentId,
        ops: &[PatchOperation],
        precondition: Option<&ETag>,
    ) -> StoreResult<Document> {
        let key = Self::key(document_type, id);
        let now = Utc::now();

        let mut partitions = self.inner.write().map_err(|_| Self::poisoned())?;
        if !Self::reap_if_expired(&mut partitions, &key, now) {
            return Err(StoreError::NotFound(format!("{document_type}/{id}")));
        }

        let entry = partitions
            .docs
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("{document_type}/{id}")))?;

        if let Some(expected) = precondition {
            if entry.doc.etag.as_ref() != Some(expected) {
                return Err(StoreError::PreconditionFailed(format!(
                    "{document_type}/{id}: opacity token changed"
                )));
            }
        }

        // Apply to a copy so a rejected operation leaves the document untouched.
        let mut updated = entry.doc.clone();
        for op in ops {
            updated
                .apply_patch(op)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        let stored = Self::stamp(updated);
        entry.doc = stored.clone();
        entry.written_at = now;
        Ok(stored)
    }

    fn delete(&self, document_type: DocumentType, id: &DocumentId) -> StoreResult<()> {
        let key = Self::key(document_type, id);
        let now = Utc::now();

        let mut partitions = self.inner.write().map_err(|_| Self::poisoned())?;
        if !Self::reap_if_expired(&mut partitions, &key, now) {
            return Err(StoreError::NotFound(format!("{document_type}/{id}")));
        }
        partitions.docs.remove(&key);
        Ok(())
    }

    fn query(&self, document_type: DocumentType, filter: &Filter) -> StoreResult<Vec<Document>> {
        let now = Utc::now();
        let partitions = self.inner.read().map_err(|_| Self::poisoned())?;

        let mut matched: Vec<&Entry> = partitions
            .docs
            .iter()
            .filter(|(k, e)| k.document_type == document_type && e.is_live_at(now))
            .map(|(_, e)| e)
            .filter(|e| filter.matches(&e.doc))
            .collect();

        matched.sort_by_key(|e| e.seq);
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }

        Ok(matched.into_iter().map(|e| e.doc.clone()).collect())
    }
}
