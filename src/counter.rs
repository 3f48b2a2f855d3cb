//! Completion counters and the wait condition they back.
//!
//! Every submitted batch is tracked by one pooled [`Counter`]: an atomic word
//! initialized to the batch size and decremented once per completed job. A
//! counter reading zero means the batch is done. Only the scheduler mutates
//! counters; callers observe them through [`WaitCondition`].
//!
//! Counters are recycled. To keep a recycled counter from confusing a caller
//! that still holds its condition, the atomic word packs a generation tag in
//! the high half next to the count in the low half: re-arming bumps the
//! generation, and a condition whose generation has moved on reads as
//! satisfied.

use std::sync::atomic::{AtomicU64, Ordering};

const COUNT_MASK: u64 = u32::MAX as u64;

/// Pooled atomic countdown. The packed layout is `generation << 32 | count`.
pub(crate) struct Counter {
    state: AtomicU64,
}

impl Counter {
    pub(crate) const fn new() -> Self {
        Counter {
            state: AtomicU64::new(0),
        }
    }

    /// Arm the counter for a batch of `jobs` jobs and return the new
    /// generation. The caller must hold the counter exclusively (freshly
    /// popped from the free pool).
    pub(crate) fn arm(&self, jobs: u32) -> u32 {
        let generation = ((self.state.load(Ordering::Relaxed) >> 32) as u32).wrapping_add(1);
        self.state
            .store(((generation as u64) << 32) | jobs as u64, Ordering::Release);
        generation
    }

    /// Record one job completion. Returns true when this call finished the
    /// batch; the caller is then responsible for returning the counter to
    /// the free pool.
    pub(crate) fn decrement(&self) -> bool {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & COUNT_MASK != 0, "counter decremented below zero");
        prev & COUNT_MASK == 1
    }

    #[inline]
    fn observe(&self) -> u64 {
        self.state.load(Ordering::Acquire)
    }
}

/// Something a job or thread can block on.
///
/// `sleep_on` is the thread-level fallback: it busy-waits without running
/// other work. From inside a running job, prefer [`crate::wait`], which
/// drains the ready queue while it waits.
pub trait Condition {
    /// Has the condition been satisfied?
    fn satisfied(&self) -> bool;

    /// Spin the calling thread until the condition is satisfied.
    fn sleep_on(&self) {
        while !self.satisfied() {
            std::hint::spin_loop();
        }
    }
}

/// Handle to a batch's completion counter, returned by the submission paths.
///
/// The handle is a cheap copy and stays meaningful after the batch finishes:
/// once the counter hits zero it may be recycled for another batch, and the
/// handle then reads as satisfied through its generation tag.
#[derive(Clone, Copy)]
pub struct WaitCondition {
    counter: &'static Counter,
    generation: u32,
}

impl WaitCondition {
    pub(crate) fn new(counter: &'static Counter, generation: u32) -> Self {
        WaitCondition {
            counter,
            generation,
        }
    }
}

impl Condition for WaitCondition {
    fn satisfied(&self) -> bool {
        let state = self.counter.observe();
        (state >> 32) as u32 != self.generation || state & COUNT_MASK == 0
    }
}
