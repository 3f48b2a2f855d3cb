//! Initialization is first-call-wins; later calls are no-ops.

use fiberjob::{initialize, submit_and_wait, worker_count, AnyRef, Config, Job};
use std::sync::atomic::{AtomicU32, Ordering};

#[test]
fn second_initialize_is_a_no_op() {
    initialize(Config {
        thread_count: 2,
        memory_budget_mb: 1,
    });
    initialize(Config {
        thread_count: 8,
        memory_budget_mb: 4,
    });

    assert_eq!(worker_count(), 2);

    // The original pool still dispatches.
    let hits = AtomicU32::new(0);
    let bump = |_: AnyRef| {
        hits.fetch_add(1, Ordering::Relaxed);
    };
    let jobs: Vec<Job> = (0..6).map(|_| Job::new(&bump, AnyRef::none())).collect();
    submit_and_wait(&jobs);
    assert_eq!(hits.load(Ordering::Relaxed), 6);
}
