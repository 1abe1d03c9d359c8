use thiserror::Error;

use jobvault_core::{DocumentId, DocumentType, Document, ETag, PatchOperation};

use super::query::Filter;

pub type StoreResult<T> = Result<T, StoreError>;

/// Document store operation error.
///
/// `Conflict`, `PreconditionFailed` and `NotFound` are the three outcomes the
/// lock layer branches on; everything else is `Backend`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// A live document with the same `(type, id)` already exists.
    #[error("document already exists: {0}")]
    Conflict(String),

    /// The opacity token supplied as a precondition is stale.
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("document not found: {0}")]
    NotFound(String),

    /// Transport, throttling, serialization or any other store-side fault.
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

/// Partitioned document store with single-document conditional writes.
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - enforce uniqueness of `(document_type, id)` among live documents
/// - replace the opacity token on every write
/// - honour `ttl` by treating a document as absent once `ttl` seconds have
///   passed since its last write (re-creating the same id is then allowed)
/// - evaluate every predicate of a [`Filter`]; a backend whose query language
///   cannot compare a field (e.g. values that are themselves serialized JSON)
///   must narrow on what it can and apply [`Filter::matches`] to the rest
pub trait DocumentStore: Send + Sync {
    /// Create the document if no live document with the same id exists.
    ///
    /// Returns the stored document (with its new opacity token), or
    /// `StoreError::Conflict`.
    fn create(&self, doc: Document) -> StoreResult<Document>;

    /// Point read.
    fn read(&self, document_type: DocumentType, id: &DocumentId) -> StoreResult<Option<Document>>;

    /// Insert or unconditionally replace.
    fn upsert(&self, doc: Document) -> StoreResult<Document>;

    /// Apply `ops` atomically to one document.
    ///
    /// With `precondition = Some(token)`, fails with `PreconditionFailed`
    /// unless the stored token still equals `token`.
    fn patch(
        &self,
        document_type: DocumentType,
        id: &DocumentId,
        ops: &[PatchOperation],
        precondition: Option<&ETag>,
    ) -> StoreResult<Document>;

    /// Point delete; `NotFound` when nothing live has that id.
    fn delete(&self, document_type: DocumentType, id: &DocumentId) -> StoreResult<()>;

    /// All live documents of a partition matching `filter`.
    fn query(&self, document_type: DocumentType, filter: &Filter) -> StoreResult<Vec<Document>>;

    /// Delete every matching document; returns how many were removed.
    ///
    /// Documents that vanish between the query and the delete are skipped.
    fn delete_where(&self, document_type: DocumentType, filter: &Filter) -> StoreResult<usize> {
        let mut deleted = 0;
        for doc in self.query(document_type, filter)? {
            match self.delete(document_type, &doc.id) {
                Ok(()) => deleted += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Set `expire_on = epoch` on every matching document.
    fn expire_where(
        &self,
        document_type: DocumentType,
        filter: &Filter,
        epoch: i64,
    ) -> StoreResult<usize> {
        self.patch_where(document_type, filter, &[PatchOperation::SetExpireOn(epoch)])
    }

    /// Remove `expire_on` from every matching document.
    fn persist_where(&self, document_type: DocumentType, filter: &Filter) -> StoreResult<usize> {
        self.patch_where(document_type, filter, &[PatchOperation::RemoveExpireOn])
    }

    /// Unconditionally patch every matching document.
    fn patch_where(
        &self,
        document_type: DocumentType,
        filter: &Filter,
        ops: &[PatchOperation],
    ) -> StoreResult<usize> {
        let mut patched = 0;
        for doc in self.query(document_type, filter)? {
            match self.patch(document_type, &doc.id, ops, None) {
                Ok(_) => patched += 1,
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(patched)
    }
}
