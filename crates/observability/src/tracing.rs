//! Tracing/logging initialization.
//!
//! The lock layer logs contention and heartbeats at `trace`; raise the filter
//! (`RUST_LOG=jobvault_infra=trace`) to watch leases change hands.

use tracing_subscriber::EnvFilter;

/// Initialize tracing/logging for the process with an `info` default.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    init_with_default("info");
}

/// Initialize tracing/logging, falling back to `directives` when `RUST_LOG`
/// is not set.
pub fn init_with_default(directives: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(directives));

    // JSON logs + timestamps, configurable via RUST_LOG.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(true)
        .with_thread_names(true)
        .try_init();
}
