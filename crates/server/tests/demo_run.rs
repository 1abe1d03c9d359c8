use std::time::Duration;

use jobvault_infra::StorageOptions;
use jobvault_server::demo::{self, DemoConfig};

#[test]
fn servers_share_the_store_without_losing_commits() {
    let options = StorageOptions::default()
        .with_transactional_lock_timeout(Duration::from_secs(10))
        .with_queue_poll_interval(Duration::from_millis(100))
        .with_expiration_check_interval(Duration::from_millis(200))
        .with_counters_aggregate_interval(Duration::from_millis(200));
    let config = DemoConfig {
        servers: 2,
        jobs_per_server: 3,
        job_expiry: Duration::ZERO,
        linger: Duration::from_millis(2500),
    };

    let report = demo::run(options, &config).unwrap();

    assert_eq!(report.committed, 12);
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.succeeded, 6);
    // Every fetched job was removed from the queue.
    assert_eq!(report.queued_left, 0);
    // Every finished job expired immediately and was swept.
    assert_eq!(report.jobs_left, 0);
}
