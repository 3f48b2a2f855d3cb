//! Process-wide job system: lifecycle, submission paths, and the
//! cooperative wait.
//!
//! The system is a singleton initialized once per process. [`initialize`]
//! builds three lockless queues (ready jobs, free fibers, free counters),
//! a pool of fibers sized from the memory budget (16 fibers per MiB, one
//! 64 KiB stack each), a matching pool of counters, and the worker threads.
//! Submitters enqueue batches with [`submit`], [`submit_async`], or
//! [`submit_and_wait`], and block on a batch with [`wait`], which keeps
//! executing other ready jobs instead of idling the thread.

use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread::{self, JoinHandle};

use tracing::{error, info, warn};

use crate::counter::{Condition, Counter, WaitCondition};
use crate::fiber_pool::FiberPool;
use crate::job::Job;
use crate::queue::Bounded;
use crate::worker::{self, RunJob};

/// Construction parameters for [`initialize`].
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Number of worker threads. `0` means hardware concurrency minus one
    /// (the submitting thread), with a floor of one worker.
    pub thread_count: u16,
    /// Memory budget for fiber stacks in MiB. Each MiB funds 16 fibers.
    pub memory_budget_mb: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            thread_count: 0,
            memory_budget_mb: 100,
        }
    }
}

pub(crate) struct JobSystem {
    pub(crate) ready: Bounded<RunJob>,
    pub(crate) fibers: FiberPool,
    pub(crate) free_counters: Bounded<&'static Counter>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    thread_count: u16,
    fiber_count: usize,
}

static SYSTEM: OnceLock<JobSystem> = OnceLock::new();

fn system() -> &'static JobSystem {
    SYSTEM
        .get()
        .expect("job system is not initialized; call initialize() first")
}

impl JobSystem {
    fn new(config: &Config) -> Self {
        let hardware = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let thread_count = if config.thread_count == 0 {
            hardware.saturating_sub(1).max(1) as u16
        } else {
            if config.thread_count as usize > hardware * 2 {
                warn!(
                    requested = config.thread_count,
                    hardware, "thread count far exceeds hardware concurrency"
                );
            }
            config.thread_count
        };

        let fiber_count = config.memory_budget_mb as usize * 16;
        assert!(
            fiber_count > 0,
            "memory budget must fund at least one fiber"
        );

        let counters: &'static [Counter] = Box::leak(
            (0..fiber_count)
                .map(|_| Counter::new())
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );
        let free_counters = Bounded::new(fiber_count);
        for counter in counters {
            free_counters.push(counter);
        }

        // Ready capacity matches the fiber pool, so enqueuing a run-job
        // that already owns a fiber can never block on queue space.
        let ready = Bounded::new(fiber_count);
        debug_assert!(ready.capacity() >= fiber_count);

        JobSystem {
            ready,
            fibers: FiberPool::new(fiber_count),
            free_counters,
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            thread_count,
            fiber_count,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Allocate a counter and one fiber per job, then enqueue the batch.
    /// With `detach`, each descriptor is first copied onto its fiber and the
    /// callable cloned alongside it.
    fn submit_batch(&self, jobs: &[Job<'_>], detach: bool) -> WaitCondition {
        assert!(!jobs.is_empty(), "empty job batch");
        assert!(jobs.len() <= u32::MAX as usize, "batch too large");

        let counter = self.free_counters.pop();
        let generation = counter.arm(jobs.len() as u32);

        for job in jobs {
            let fiber = self.fibers.acquire();
            let declaration = if detach {
                unsafe { (*fiber).stage(job) }
            } else {
                job as *const Job<'_> as *const Job<'static>
            };
            self.ready.push(RunJob {
                job: declaration,
                fiber,
                counter,
            });
        }

        #[cfg(feature = "metrics")]
        crate::metrics::METRICS.record_batch_submitted(jobs.len() as u64);

        WaitCondition::new(counter, generation)
    }

    /// Execute ready jobs until `condition` is satisfied.
    fn drain_until(&self, condition: &WaitCondition) {
        while !condition.satisfied() {
            match self.ready.try_pop() {
                Some(run) => {
                    #[cfg(feature = "metrics")]
                    crate::metrics::METRICS.record_job_drained_in_wait();
                    worker::execute(self, run);
                }
                None => std::hint::spin_loop(),
            }
        }
    }
}

/// Bring the job system up. Idempotent: the first call takes effect and
/// later calls log an error and do nothing.
pub fn initialize(config: Config) {
    let mut created = false;
    let system = SYSTEM.get_or_init(|| {
        created = true;
        JobSystem::new(&config)
    });

    if !created {
        error!("job system already initialized; ignoring");
        return;
    }

    let handles = worker::spawn_workers(system, system.thread_count);
    *system.workers.lock().expect("worker registry poisoned") = handles;

    info!(
        threads = system.thread_count,
        fibers = system.fiber_count,
        "job system online"
    );
}

/// Submit a batch of jobs and return a condition that is satisfied when all
/// of them have completed.
///
/// No copies of the descriptors are made: the run-queue references the
/// caller's jobs directly.
///
/// # Safety
///
/// Every descriptor's callable and borrowed argument must stay alive and at
/// a stable address until the returned condition is satisfied. The
/// descriptors themselves must stay alive until each job has *started*
/// executing (keeping them alive alongside the callables is the simple way
/// to honor both).
///
/// # Examples
///
/// ```no_run
/// use fiberjob::{initialize, submit, wait, AnyRef, Config, Job};
/// use std::sync::atomic::{AtomicU32, Ordering};
///
/// initialize(Config::default());
///
/// let hits = AtomicU32::new(0);
/// let bump = |_: AnyRef| {
///     hits.fetch_add(1, Ordering::Relaxed);
/// };
/// let jobs: Vec<Job> = (0..4).map(|_| Job::new(&bump, AnyRef::none())).collect();
///
/// // SAFETY: `bump` and `hits` outlive the wait below.
/// let done = unsafe { submit(&jobs) };
/// wait(&done);
/// assert_eq!(hits.load(Ordering::Relaxed), 4);
/// ```
pub unsafe fn submit(jobs: &[Job<'_>]) -> WaitCondition {
    system().submit_batch(jobs, false)
}

/// Submit a batch of jobs detached from the caller: each descriptor is
/// copied onto its assigned fiber and the callable cloned into fiber-owned
/// storage, so the caller's jobs and callables may be dropped as soon as
/// this returns. Clones are destroyed when their fiber is freed.
///
/// # Safety
///
/// A *borrowed* argument ([`AnyRef::new`]) must still outlive the batch; the
/// copy captures the pointer, not the referent. Arguments stored inline with
/// [`Job::with_value`] and state owned by the callable itself travel with
/// the copy and impose no liveness requirement.
pub unsafe fn submit_async(jobs: &[Job<'_>]) -> WaitCondition {
    system().submit_batch(jobs, true)
}

/// Submit a batch and block the calling thread until it completes, draining
/// other ready jobs in the meantime.
///
/// The batch's condition is consumed internally and never exposed. Unlike
/// [`submit`], this is safe: the borrows inside `jobs` cannot end before the
/// call returns, and it returns only after every job has finished.
pub fn submit_and_wait(jobs: &[Job<'_>]) {
    let system = system();
    let condition = system.submit_batch(jobs, false);
    system.drain_until(&condition);
}

/// Block the current job or thread until `condition` is satisfied.
///
/// This is the cooperative form of blocking: while the condition is not yet
/// satisfied, ready jobs are popped and executed on the caller's thread,
/// exactly as a worker would run them. A job that calls `wait` keeps its own
/// fiber and stack; nested jobs run on their own fibers beneath it.
///
/// If the condition can only be satisfied by jobs that are themselves stuck
/// behind this waiter, the system livelocks; batches must be satisfiable by
/// the remaining workers.
pub fn wait(condition: &WaitCondition) {
    system().drain_until(condition);
}

/// Tear the job system down for process exit. Worker threads are detached
/// and stop dispatching; queued jobs are abandoned unexecuted, and a job
/// already running keeps its thread until the callable returns. No
/// completion guarantees are made for jobs in flight.
pub fn quit() {
    let Some(system) = SYSTEM.get() else {
        warn!("quit called before initialize");
        return;
    };
    system.shutdown.store(true, Ordering::Release);
    let handles = mem::take(&mut *system.workers.lock().expect("worker registry poisoned"));
    drop(handles);
    info!("job system terminated");
}

/// Number of worker threads the system was initialized with.
pub fn worker_count() -> usize {
    system().thread_count as usize
}
