//! # fiberjob: a fiber-based job system
//!
//! A fixed pool of worker threads executing short jobs on pooled 64 KiB
//! coroutine stacks ("fibers"), in the style of big game-engine schedulers.
//! A submitter dispatches a batch of jobs, keeps working, and later blocks
//! *the current job*, not the worker thread, on the batch's completion
//! counter; a blocked job's thread picks up other ready jobs instead of
//! idling.
//!
//! ## Architecture
//!
//! - **Bounded MPMC queues**: one lockless ticket-protocol queue for ready
//!   jobs and one each for the free fiber and free counter pools.
//! - **Fibers**: pooled coroutines with private 64 KiB stacks; every job
//!   runs on its own fiber.
//! - **Counters**: pooled atomic countdowns, one per batch; a counter at
//!   zero means the batch is done.
//! - **Workers**: OS threads looping pop → run on fiber → free fiber →
//!   decrement counter.
//!
//! All pools are sized at [`initialize`] and never grow: the fiber count is
//! `memory_budget_mb × 16`, and submission blocks (spinning) when the pools
//! are exhausted rather than allocating.
//!
//! ## Example
//!
//! ```no_run
//! use fiberjob::{initialize, submit_and_wait, AnyRef, Config, Job};
//! use std::sync::atomic::{AtomicU32, Ordering};
//!
//! initialize(Config::default());
//!
//! let hits = AtomicU32::new(0);
//! let bump = |_: AnyRef| {
//!     hits.fetch_add(1, Ordering::Relaxed);
//! };
//! let jobs: Vec<Job> = (0..8).map(|_| Job::new(&bump, AnyRef::none())).collect();
//!
//! submit_and_wait(&jobs);
//! assert_eq!(hits.load(Ordering::Relaxed), 8);
//! ```

pub mod counter;
pub mod job;
pub mod job_system;

mod fiber;
mod fiber_pool;
mod queue;
mod worker;

#[cfg(feature = "metrics")]
pub mod metrics;

pub use counter::{Condition, WaitCondition};
pub use job::{AnyRef, Job};
pub use job_system::{
    initialize, quit, submit, submit_and_wait, submit_async, wait, worker_count, Config,
};
