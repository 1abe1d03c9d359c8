use std::time::Duration;

use anyhow::Context;

use jobvault_infra::StorageOptions;
use jobvault_server::demo::{self, DemoConfig};

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn main() -> anyhow::Result<()> {
    jobvault_observability::init();

    let options = StorageOptions::from_env().context("invalid storage options")?;
    options.log_options();

    let config = DemoConfig {
        servers: env_or("JOBVAULT_DEMO_SERVERS", 3),
        jobs_per_server: env_or("JOBVAULT_DEMO_JOBS", 25),
        job_expiry: Duration::from_secs(env_or("JOBVAULT_DEMO_JOB_EXPIRY_SECS", 5)),
        linger: Duration::from_secs(env_or("JOBVAULT_DEMO_LINGER_SECS", 10)),
    };

    let report = demo::run(options, &config)?;
    tracing::info!(
        committed = report.committed,
        abandoned = report.abandoned,
        jobs_left = report.jobs_left,
        queued_left = report.queued_left,
        succeeded = report.succeeded,
        "demo finished"
    );
    Ok(())
}
