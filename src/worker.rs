//! Worker threads: the dispatch loop that turns queued run-jobs into
//! completed batches.
//!
//! A worker pops a run-job from the shared ready queue, switches onto the
//! job's fiber, and on return frees the fiber and decrements the batch
//! counter, recycling the counter when the batch is done. Waiters draining
//! the queue inside [`crate::wait`] execute run-jobs through exactly the
//! same path.

use std::any::Any;
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

use crate::counter::Counter;
use crate::fiber::{Fiber, JobPtr};
use crate::job::Job;
use crate::job_system::JobSystem;

/// A queued unit of execution: the descriptor to run, the fiber that will
/// host it, and the batch counter to decrement when it completes.
pub(crate) struct RunJob {
    pub(crate) job: *const Job<'static>,
    pub(crate) fiber: *mut Fiber,
    pub(crate) counter: &'static Counter,
}

// A RunJob is owned by whichever queue slot or executing thread currently
// holds it, and its fiber is uniquely assigned to it.
unsafe impl Send for RunJob {}

/// Execute one run-job to completion: switch onto its fiber, then free the
/// fiber and decrement the counter. The counter goes back to the free pool
/// iff this was the batch's last job.
pub(crate) fn execute(system: &JobSystem, run: RunJob) {
    let outcome = unsafe { (*run.fiber).run(JobPtr(run.job)) };
    system.fibers.release(run.fiber);

    if let Err(payload) = outcome {
        error!("job panicked: {}", panic_message(&payload));
    }

    if run.counter.decrement() {
        system.free_counters.push(run.counter);
    }

    #[cfg(feature = "metrics")]
    crate::metrics::METRICS.record_job_completed();
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

fn run_loop(system: &'static JobSystem, ordinal: usize) {
    debug!(worker = ordinal, "worker online");
    while !system.is_shutdown() {
        match system.ready.try_pop() {
            Some(run) => execute(system, run),
            None => thread::yield_now(),
        }
    }
    debug!(worker = ordinal, "worker offline");
}

/// Spawn the worker threads. OS thread names start at "Thread 2"; the
/// initializing thread is thread 1.
pub(crate) fn spawn_workers(system: &'static JobSystem, count: u16) -> Vec<JoinHandle<()>> {
    (0..count as usize)
        .map(|i| {
            let ordinal = i + 2;
            thread::Builder::new()
                .name(format!("Thread {ordinal}"))
                .spawn(move || run_loop(system, ordinal))
                .expect("failed to spawn worker thread")
        })
        .collect()
}
