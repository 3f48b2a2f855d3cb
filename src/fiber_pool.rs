//! Fixed pool of fibers, handed out through a lockless free list.

use crate::fiber::Fiber;
use crate::queue::Bounded;

/// Raw handle to a pooled fiber. Ownership moves with the handle: a fiber is
/// referenced by the free list, by one queued run-job, or by the one thread
/// currently executing it, never more than one at a time.
pub(crate) struct FiberPtr(pub(crate) *mut Fiber);

unsafe impl Send for FiberPtr {}

struct Storage(Vec<Box<Fiber>>);

// The storage vector is never touched after construction; fibers are only
// reached through exclusively-owned FiberPtr handles.
unsafe impl Sync for Storage {}
unsafe impl Send for Storage {}

/// All fibers are created at initialization and live for the process.
pub(crate) struct FiberPool {
    _storage: Storage,
    free: Bounded<FiberPtr>,
}

impl FiberPool {
    /// Build `count` fibers, each with its stack allocated up front; this is
    /// where the memory budget is actually spent.
    pub(crate) fn new(count: usize) -> Self {
        let mut storage = Vec::with_capacity(count);
        let free = Bounded::new(count);
        for _ in 0..count {
            let mut fiber = Box::new(Fiber::new());
            fiber.prepare();
            free.push(FiberPtr(&mut *fiber as *mut Fiber));
            storage.push(fiber);
        }
        FiberPool {
            _storage: Storage(storage),
            free,
        }
    }

    /// Take a ready fiber out of the free list, spinning if the pool is
    /// exhausted.
    pub(crate) fn acquire(&self) -> *mut Fiber {
        self.free.pop().0
    }

    /// Tear down the fiber's activation state and return it to the free
    /// list, ready for its next job.
    pub(crate) fn release(&self, fiber: *mut Fiber) {
        unsafe { (*fiber).release() };
        self.free.push(FiberPtr(fiber));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::JobPtr;
    use crate::job::{AnyRef, Job};
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn acquire_release_cycles_through_the_pool() {
        let pool = FiberPool::new(2);
        let first = pool.acquire();
        let second = pool.acquire();
        assert_ne!(first, second);

        pool.release(first);
        let third = pool.acquire();
        assert_eq!(third, first);
        pool.release(second);
        pool.release(third);
    }

    #[test]
    fn pooled_fiber_runs_jobs() {
        let pool = FiberPool::new(1);
        let hits = AtomicU32::new(0);
        let bump = |_: AnyRef| {
            hits.fetch_add(1, Ordering::Relaxed);
        };
        let job = Job::new(&bump, AnyRef::none());

        for _ in 0..3 {
            let fiber = pool.acquire();
            unsafe { &mut *fiber }
                .run(JobPtr(&job as *const Job as *const Job<'static>))
                .unwrap();
            pool.release(fiber);
        }
        assert_eq!(hits.load(Ordering::Relaxed), 3);
    }
}
