//! Persistent job queues.
//!
//! A worker claims an entry by stamping `fetched_at` with a conditional
//! patch, keeps the claim fresh every keep-alive interval while the job runs,
//! and finally removes the entry or hands it back. An entry whose claim has
//! not been refreshed for two keep-alive intervals is considered abandoned
//! and can be fetched again.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, trace, warn};

use jobvault_core::time::now_epoch;
use jobvault_core::{Document, DocumentBody, DocumentId, DocumentType, ETag, PatchOperation};

use crate::components::CancellationToken;
use crate::config::StorageOptions;
use crate::store::{DocumentStore, Filter, StoreError, StoreResult};

/// One enqueue, identified before it is written so that writing it twice
/// leaves a single entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: DocumentId,
    pub queue: String,
    pub job_id: String,
    pub created_on: DateTime<Utc>,
}

impl QueueEntry {
    pub fn new(queue: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            id: DocumentId::generate(),
            queue: queue.into(),
            job_id: job_id.into(),
            created_on: Utc::now(),
        }
    }

    fn to_document(&self) -> Document {
        Document::with_id(
            self.id.clone(),
            DocumentBody::Queue {
                name: self.queue.clone(),
                job_id: self.job_id.clone(),
                created_on: self.created_on,
                fetched_at: None,
            },
        )
    }
}

/// Where enqueued jobs go and where workers take them from.
pub trait JobQueue: Send + Sync {
    /// Write `entry`; writing the same entry again is a no-op.
    fn enqueue(&self, entry: &QueueEntry) -> StoreResult<()>;

    /// Claim the oldest available entry of the first non-empty queue in
    /// `queues`, polling until one shows up.
    ///
    /// Returns `None` once `cancel` fires.
    fn dequeue(&self, queues: &[&str], cancel: &CancellationToken) -> StoreResult<Option<FetchedJob>>;
}

/// Queue backed by the document store: one `queue` document per enqueue.
#[derive(Clone)]
pub struct DocumentJobQueue {
    store: Arc<dyn DocumentStore>,
    poll_interval: Duration,
    keep_alive_interval: Duration,
}

impl DocumentJobQueue {
    pub fn new(store: Arc<dyn DocumentStore>, options: &StorageOptions) -> Self {
        Self {
            store,
            poll_interval: options.queue_poll_interval,
            keep_alive_interval: options.job_keep_alive_interval,
        }
    }

    /// Job ids in `queue`, oldest first, claimed or not.
    pub fn queued_job_ids(&self, queue: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries(queue)?
            .into_iter()
            .filter_map(|doc| match doc.body {
                DocumentBody::Queue { job_id, .. } => Some(job_id),
                _ => None,
            })
            .collect())
    }

    fn entries(&self, queue: &str) -> StoreResult<Vec<Document>> {
        let mut docs = self.store.query(DocumentType::Queue, &Filter::by_key(queue))?;
        docs.sort_by_key(|doc| match doc.body {
            DocumentBody::Queue { created_on, .. } => created_on,
            _ => DateTime::<Utc>::MIN_UTC,
        });
        Ok(docs)
    }

    /// Epoch second before which a claim counts as abandoned.
    fn abandoned_before(&self) -> i64 {
        let keep_alive = self.keep_alive_interval.as_secs().max(1) as i64;
        now_epoch() - 2 * keep_alive
    }

    /// One pass over `queues`; `None` when nothing could be claimed.
    fn try_claim(&self, queues: &[&str]) -> StoreResult<Option<FetchedJob>> {
        let abandoned_before = self.abandoned_before();

        for queue in queues {
            for doc in self.entries(queue)? {
                let DocumentBody::Queue { job_id, fetched_at, .. } = &doc.body else {
                    continue;
                };
                if fetched_at.is_some_and(|at| at >= abandoned_before) {
                    continue;
                }

                let claim = [PatchOperation::SetFetchedAt(Some(now_epoch()))];
                match self
                    .store
                    .patch(DocumentType::Queue, &doc.id, &claim, doc.etag.as_ref())
                {
                    Ok(claimed) => {
                        if fetched_at.is_some() {
                            warn!(queue, job_id = %job_id, "re-fetching an abandoned queue entry");
                        }
                        debug!(queue, job_id = %job_id, "job fetched");
                        return Ok(Some(FetchedJob::start(
                            self.store.clone(),
                            claimed.id,
                            queue.to_string(),
                            job_id.clone(),
                            claimed.etag,
                            self.keep_alive_interval,
                        )));
                    }
                    // Another worker got there first.
                    Err(StoreError::PreconditionFailed(_) | StoreError::NotFound(_)) => {
                        trace!(queue, job_id = %job_id, "queue entry taken by another worker");
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(None)
    }
}

impl JobQueue for DocumentJobQueue {
    fn enqueue(&self, entry: &QueueEntry) -> StoreResult<()> {
        self.store.upsert(entry.to_document())?;
        trace!(queue = %entry.queue, job_id = %entry.job_id, "job enqueued");
        Ok(())
    }

    fn dequeue(&self, queues: &[&str], cancel: &CancellationToken) -> StoreResult<Option<FetchedJob>> {
        loop {
            if let Some(fetched) = self.try_claim(queues)? {
                return Ok(Some(fetched));
            }
            if cancel.wait(self.poll_interval) {
                return Ok(None);
            }
        }
    }
}

impl core::fmt::Debug for DocumentJobQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DocumentJobQueue")
            .field("poll_interval", &self.poll_interval)
            .field("keep_alive_interval", &self.keep_alive_interval)
            .finish_non_exhaustive()
    }
}

/// A claimed queue entry.
///
/// A background thread refreshes the claim until the job is removed,
/// requeued or dropped. Dropping stops the refresh without touching the
/// entry, which becomes fetchable again once the claim goes stale.
pub struct FetchedJob {
    store: Arc<dyn DocumentStore>,
    id: DocumentId,
    queue: String,
    job_id: String,
    stop: CancellationToken,
    keep_alive: Option<JoinHandle<()>>,
}

impl FetchedJob {
    fn start(
        store: Arc<dyn DocumentStore>,
        id: DocumentId,
        queue: String,
        job_id: String,
        etag: Option<ETag>,
        interval: Duration,
    ) -> Self {
        let stop = CancellationToken::new();
        let keep_alive = {
            let (store, id, stop) = (store.clone(), id.clone(), stop.clone());
            thread::Builder::new()
                .name(format!("queue-keep-alive:{job_id}"))
                .spawn(move || keep_alive_loop(store.as_ref(), &id, etag, interval, &stop))
        };
        let keep_alive = match keep_alive {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "failed to spawn queue keep-alive thread");
                None
            }
        };

        Self {
            store,
            id,
            queue,
            job_id,
            stop,
            keep_alive,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Delete the entry: the job is done with this queue.
    pub fn remove_from_queue(mut self) -> StoreResult<()> {
        self.stop_keep_alive();
        match self.store.delete(DocumentType::Queue, &self.id) {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Hand the entry back so any worker can fetch it right away.
    pub fn requeue(mut self) -> StoreResult<()> {
        self.stop_keep_alive();
        let release = [PatchOperation::SetFetchedAt(None)];
        match self.store.patch(DocumentType::Queue, &self.id, &release, None) {
            Ok(_) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn stop_keep_alive(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.keep_alive.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FetchedJob {
    fn drop(&mut self) {
        self.stop_keep_alive();
    }
}

impl core::fmt::Debug for FetchedJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FetchedJob")
            .field("queue", &self.queue)
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

fn keep_alive_loop(
    store: &dyn DocumentStore,
    id: &DocumentId,
    mut etag: Option<ETag>,
    interval: Duration,
    stop: &CancellationToken,
) {
    while !stop.wait(interval) {
        let refresh = [PatchOperation::SetFetchedAt(Some(now_epoch()))];
        match store.patch(DocumentType::Queue, id, &refresh, etag.as_ref()) {
            Ok(doc) => {
                trace!(id = %id, "queue entry kept alive");
                etag = doc.etag;
            }
            Err(StoreError::PreconditionFailed(_)) => {
                warn!(id = %id, "queue entry claimed by another worker; keep-alive stopped");
                return;
            }
            Err(StoreError::NotFound(_)) => return,
            Err(e) => debug!(id = %id, error = %e, "queue keep-alive failed; retrying"),
        }
    }
}
