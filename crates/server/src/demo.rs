use std::ops::AddAssign;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, anyhow};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use jobvault_core::{Document, DocumentBody, DocumentId, DocumentType, JobState};
use jobvault_infra::components::{CancellationToken, ComponentRunner};
use jobvault_infra::store::{DocumentStore, Filter, InMemoryDocumentStore};
use jobvault_infra::{CommitOutcome, JobStorage, StorageOptions};

const QUEUE: &str = "default";

/// Demo shape.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    pub servers: usize,
    pub jobs_per_server: usize,
    /// Expiry applied to finished jobs.
    pub job_expiry: Duration,
    /// How long the components keep running after the workers finish.
    pub linger: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DemoReport {
    pub committed: usize,
    pub abandoned: usize,
    /// Job documents still in the store at shutdown.
    pub jobs_left: usize,
    /// Entries still waiting in the queue at shutdown.
    pub queued_left: usize,
    /// Net value of the `stats:succeeded` counter.
    pub succeeded: i64,
}

#[derive(Debug, Default)]
struct Tally {
    committed: usize,
    abandoned: usize,
}

impl Tally {
    fn record(&mut self, outcome: CommitOutcome) {
        if outcome.is_committed() {
            self.committed += 1;
        } else {
            self.abandoned += 1;
        }
    }
}

impl AddAssign for Tally {
    fn add_assign(&mut self, other: Self) {
        self.committed += other.committed;
        self.abandoned += other.abandoned;
    }
}

/// Run `config.servers` servers over one in-memory store until every worker
/// has processed its jobs, then let the components run for `config.linger`.
pub fn run(options: StorageOptions, config: &DemoConfig) -> anyhow::Result<DemoReport> {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
    let cancel = CancellationToken::new();

    let mut components = Vec::new();
    let mut workers = Vec::new();

    for n in 1..=config.servers {
        let server = format!("server-{n}");
        let storage = JobStorage::new(store.clone(), options.clone())?;

        for component in storage.components() {
            let handle = ComponentRunner::spawn(component, cancel.clone())
                .with_context(|| format!("failed to start components of {server}"))?;
            components.push(handle);
        }

        let jobs = config.jobs_per_server;
        let expiry = config.job_expiry;
        let stop = cancel.clone();
        let worker = thread::Builder::new()
            .name(server.clone())
            .spawn(move || process_jobs(&server, &storage, jobs, expiry, &stop))
            .context("failed to spawn worker thread")?;
        workers.push(worker);
    }

    let mut tally = Tally::default();
    for worker in workers {
        tally += worker
            .join()
            .map_err(|_| anyhow!("worker thread panicked"))??;
    }

    info!(linger = ?config.linger, "workers finished; components keep running");
    cancel.wait(config.linger);
    cancel.cancel();
    for handle in components {
        handle.shutdown();
    }

    let jobs_left = store.query(DocumentType::Job, &Filter::all())?.len();
    let queued_left = store.query(DocumentType::Queue, &Filter::by_key(QUEUE))?.len();
    let succeeded = store
        .query(DocumentType::Counter, &Filter::by_key("stats:succeeded"))?
        .iter()
        .map(|doc| match doc.body {
            DocumentBody::Counter { value, .. } => value,
            _ => 0,
        })
        .sum();

    Ok(DemoReport {
        committed: tally.committed,
        abandoned: tally.abandoned,
        jobs_left,
        queued_left,
        succeeded,
    })
}

/// Enqueue `jobs` jobs, and for each one enqueued fetch one from the shared
/// queue (not necessarily the same job) and mark it succeeded.
fn process_jobs(
    server: &str,
    storage: &JobStorage,
    jobs: usize,
    expiry: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<Tally> {
    let mut tally = Tally::default();

    for n in 0..jobs {
        let job_id = DocumentId::generate();
        let invocation = json!({ "type": "DemoJob", "method": "Run", "args": [server, n] });
        storage.store().create(Document::with_id(
            job_id.clone(),
            DocumentBody::Job {
                invocation_data: invocation.to_string(),
                state_id: None,
                state_name: None,
                created_on: Utc::now(),
            },
        ))?;

        let mut tx = storage.transaction();
        tx.set_job_state(
            job_id.as_str(),
            &JobState::new("Enqueued").with_reason(format!("created by {server}")),
        )?;
        tx.add_to_queue(QUEUE, job_id.as_str())?;
        tx.increment_counter("stats:enqueued")?;
        let enqueued = tx.commit()?;
        tally.record(enqueued);
        if !enqueued.is_committed() {
            // Nothing was added to the queue, so there is nothing to fetch.
            continue;
        }

        let Some(fetched) = storage.fetch_next_job(&[QUEUE], cancel)? else {
            break;
        };
        let job_id = fetched.job_id().to_string();

        let mut tx = storage.transaction();
        tx.set_job_state(
            job_id.as_str(),
            &JobState::new("Succeeded").with_data("PerformedBy", server),
        )?;
        tx.increment_counter("stats:succeeded")?;
        tx.insert_to_list("succeeded", job_id.as_str())?;
        tx.trim_list("succeeded", 0, 99)?;
        tx.set_range_in_hash(
            &format!("server:{server}"),
            [
                ("LastJob".to_string(), job_id.to_string()),
                ("LastHeartbeat".to_string(), Utc::now().to_rfc3339()),
            ],
        )?;
        tx.expire_job(job_id.as_str(), expiry)?;
        let outcome = tx.commit()?;
        tally.record(outcome);

        if outcome.is_committed() {
            fetched.remove_from_queue()?;
        } else {
            fetched.requeue()?;
        }

        debug!(server, job_id, "job processed");
    }

    Ok(tally)
}
