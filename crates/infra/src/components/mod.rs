//! Periodic server components.
//!
//! Every server process runs the same components against the shared store.
//! Each component takes its own lease per cycle, so at most one process does
//! the work of a given cycle and the others skip it.

pub mod cancellation;
pub mod counters;
pub mod expiration;
pub mod runner;

use std::sync::Arc;

use thiserror::Error;

use crate::lock::LockError;
use crate::storage::JobStorage;
use crate::store::StoreError;

pub use cancellation::CancellationToken;
pub use counters::CountersAggregator;
pub use expiration::ExpirationManager;
pub use runner::{ComponentHandle, ComponentRunner};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ComponentError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A unit of background work invoked repeatedly until cancelled.
///
/// `execute` runs one cycle and is expected to wait out its own interval
/// (through the token, so shutdown is not delayed) before returning.
pub trait ServerComponent: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, cancel: &CancellationToken) -> Result<(), ComponentError>;
}

/// The components a server built on `storage` runs.
pub fn components_for(storage: &JobStorage) -> Vec<Arc<dyn ServerComponent>> {
    vec![
        Arc::new(ExpirationManager::new(storage.clone())),
        Arc::new(CountersAggregator::new(storage.clone())),
    ]
}
