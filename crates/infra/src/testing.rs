//! Test doubles shared by the unit tests of this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use jobvault_core::{Document, DocumentId, DocumentType, ETag, PatchOperation};

use crate::components::CancellationToken;
use crate::store::{DocumentStore, Filter, InMemoryDocumentStore, StoreError, StoreResult};

/// In-memory store that can be told to fail the next N writes of a kind,
/// or to cancel a token when it deletes a given category.
#[derive(Debug, Default)]
pub struct FaultyStore {
    inner: InMemoryDocumentStore,
    create_faults: AtomicUsize,
    patch_faults: AtomicUsize,
    cancel_on_delete: Mutex<Option<(DocumentType, CancellationToken)>>,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creates(&self, times: usize) {
        self.create_faults.store(times, Ordering::SeqCst);
    }

    pub fn fail_patches(&self, times: usize) {
        self.patch_faults.store(times, Ordering::SeqCst);
    }

    /// Fire `token` whenever a document of `document_type` is deleted.
    pub fn cancel_on_delete(&self, document_type: DocumentType, token: CancellationToken) {
        *self
            .cancel_on_delete
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some((document_type, token));
    }

    fn trip(counter: &AtomicUsize) -> StoreResult<()> {
        let tripped = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::Backend("injected fault".to_string()))
        } else {
            Ok(())
        }
    }
}

impl DocumentStore for FaultyStore {
    fn create(&self, doc: Document) -> StoreResult<Document> {
        Self::trip(&self.create_faults)?;
        self.inner.create(doc)
    }

    fn read(&self, document_type: DocumentType, id: &DocumentId) -> StoreResult<Option<Document>> {
        self.inner.read(document_type, id)
    }

    fn upsert(&self, doc: Document) -> StoreResult<Document> {
        self.inner.upsert(doc)
    }

    fn patch(
        &self,
        document_type: DocumentType,
        id: &DocumentId,
        ops: &[PatchOperation],
        precondition: Option<&ETag>,
    ) -> StoreResult<Document> {
        Self::trip(&self.patch_faults)?;
        self.inner.patch(document_type, id, ops, precondition)
    }

    fn delete(&self, document_type: DocumentType, id: &DocumentId) -> StoreResult<()> {
        self.inner.delete(document_type, id)?;
        if let Some((watched, token)) = &*self
            .cancel_on_delete
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
        {
            if *watched == document_type {
                token.cancel();
            }
        }
        Ok(())
    }

    fn query(&self, document_type: DocumentType, filter: &Filter) -> StoreResult<Vec<Document>> {
        self.inner.query(document_type, filter)
    }
}
