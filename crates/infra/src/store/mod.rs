//! Shared document store boundary.
//!
//! The lock layer, the write-only transaction and the periodic components only
//! ever talk to the store through [`DocumentStore`]. The contract is the
//! minimum a document database offers without multi-document transactions:
//! create-if-absent, conditional patch on an opacity token, point delete and
//! a partition-scoped query.

pub mod in_memory;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryDocumentStore;
pub use query::Filter;
pub use r#trait::{DocumentStore, StoreError, StoreResult};
