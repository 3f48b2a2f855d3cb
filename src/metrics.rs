//! Optional scheduler metrics, compiled in with the `metrics` feature.

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) static METRICS: Metrics = Metrics::new();

/// Process-wide counters updated by the scheduler.
pub struct Metrics {
    jobs_completed: AtomicU64,
    jobs_submitted: AtomicU64,
    batches_submitted: AtomicU64,
    jobs_drained_in_wait: AtomicU64,
}

impl Metrics {
    const fn new() -> Self {
        Metrics {
            jobs_completed: AtomicU64::new(0),
            jobs_submitted: AtomicU64::new(0),
            batches_submitted: AtomicU64::new(0),
            jobs_drained_in_wait: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_submitted(&self, jobs: u64) {
        self.batches_submitted.fetch_add(1, Ordering::Relaxed);
        self.jobs_submitted.fetch_add(jobs, Ordering::Relaxed);
    }

    pub(crate) fn record_job_drained_in_wait(&self) {
        self.jobs_drained_in_wait.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_submitted: self.jobs_submitted.load(Ordering::Relaxed),
            batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
            jobs_drained_in_wait: self.jobs_drained_in_wait.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the scheduler counters.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    /// Jobs that ran to completion (including panicked jobs).
    pub jobs_completed: u64,
    /// Jobs enqueued across all submission paths.
    pub jobs_submitted: u64,
    /// Batches enqueued across all submission paths.
    pub batches_submitted: u64,
    /// Jobs executed by waiting threads rather than workers.
    pub jobs_drained_in_wait: u64,
}

/// Read the current scheduler counters.
pub fn snapshot() -> MetricsSnapshot {
    METRICS.snapshot()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_monotonic() {
        let before = snapshot();
        METRICS.record_batch_submitted(3);
        METRICS.record_job_completed();
        METRICS.record_job_drained_in_wait();
        let after = snapshot();

        assert_eq!(after.batches_submitted, before.batches_submitted + 1);
        assert_eq!(after.jobs_submitted, before.jobs_submitted + 3);
        assert_eq!(after.jobs_completed, before.jobs_completed + 1);
        assert_eq!(
            after.jobs_drained_in_wait,
            before.jobs_drained_in_wait + 1
        );
    }
}
