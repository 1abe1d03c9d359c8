//! Entry point tying the store, options, queue and lock executor together.

use std::sync::Arc;
use std::time::Duration;

use crate::components::{self, CancellationToken, ServerComponent};
use crate::config::{ConfigError, StorageOptions};
use crate::lock::{DistributedLockExecutor, LockHandle, LockResult};
use crate::queue::{DocumentJobQueue, FetchedJob, JobQueue};
use crate::store::{DocumentStore, StoreResult};
use crate::transaction::WriteOnlyTransaction;

/// Job storage shared by every worker and component of one process.
///
/// Cheap to clone; clones share the same store and queue.
#[derive(Clone)]
pub struct JobStorage {
    store: Arc<dyn DocumentStore>,
    options: Arc<StorageOptions>,
    queue: Arc<dyn JobQueue>,
    lock_executor: DistributedLockExecutor,
}

impl JobStorage {
    /// Storage over `store` with a document-backed queue.
    pub fn new(store: Arc<dyn DocumentStore>, options: StorageOptions) -> Result<Self, ConfigError> {
        options.validate()?;
        Ok(Self {
            queue: Arc::new(DocumentJobQueue::new(store.clone(), &options)),
            lock_executor: DistributedLockExecutor::new(store.clone()),
            options: Arc::new(options),
            store,
        })
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn lock_executor(&self) -> &DistributedLockExecutor {
        &self.lock_executor
    }

    pub fn acquire_distributed_lock(&self, resource: &str, timeout: Duration) -> LockResult<LockHandle> {
        self.lock_executor.acquire_lock(resource, timeout)
    }

    /// Claim the next job from `queues`, waiting `queue_poll_interval`
    /// between empty polls; `None` once `cancel` fires.
    pub fn fetch_next_job(
        &self,
        queues: &[&str],
        cancel: &CancellationToken,
    ) -> StoreResult<Option<FetchedJob>> {
        self.queue.dequeue(queues, cancel)
    }

    pub fn transaction(&self) -> WriteOnlyTransaction {
        WriteOnlyTransaction::new(self.clone())
    }

    /// Periodic components every server built on this storage runs.
    pub fn components(&self) -> Vec<Arc<dyn ServerComponent>> {
        components::components_for(self)
    }
}

impl core::fmt::Debug for JobStorage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobStorage")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}
