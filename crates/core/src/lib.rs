//! `jobvault-core`: document model shared by the storage layer.
//!
//! This crate contains **pure data** primitives (no I/O): the document
//! categories persisted in the shared store, the lease view used by the lock
//! layer, and the epoch helpers every expiry computation goes through.

pub mod document;
pub mod error;
pub mod id;
pub mod time;

pub use document::{
    CounterType, Document, DocumentBody, DocumentType, JobState, Lease, PatchOperation, StateData,
};
pub use error::{DomainError, DomainResult};
pub use id::{DocumentId, ETag};
