//! Fibers: pooled 64 KiB execution contexts for jobs.
//!
//! Each fiber owns a dedicated coroutine stack. A worker (or a waiter
//! draining the ready queue) switches onto the fiber with [`Fiber::run`],
//! the trampoline closure invokes the job's callable, and control returns to
//! the caller when the callable does. A job that waits stays on its own
//! stack and resumes other fibers nested beneath it, so suspension never
//! migrates a job between threads mid-run.
//!
//! Alongside the stack every fiber carries a [`DetachArena`]: fixed storage
//! the async submission path copies the 64-byte descriptor into, cloning the
//! callable just below it. The clone is destroyed when the fiber is freed.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::any::Any;
use std::mem::MaybeUninit;
use std::panic::{self, AssertUnwindSafe};

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult};

use crate::job::Job;

/// Stack size of every fiber. 16 fibers per MiB of memory budget.
pub(crate) const STACK_SIZE: usize = 64 * 1024;

/// Bytes of fiber-owned storage for detached descriptors and their callable
/// clones. Clones that do not fit fall back to the global allocator.
const DETACH_BYTES: usize = 256;

/// Pointer to the descriptor a fiber activation should run. Sent to the
/// trampoline as the coroutine's resume input.
pub(crate) struct JobPtr(pub(crate) *const Job<'static>);

// The scheduler hands a JobPtr to exactly one fiber activation, and the
// submission contract keeps the descriptor alive until that activation
// completes.
unsafe impl Send for JobPtr {}

#[repr(align(16))]
struct DetachBuf([MaybeUninit<u8>; DETACH_BYTES]);

enum CloneSlot {
    Inline {
        ptr: *mut u8,
        drop: unsafe fn(*mut u8),
    },
    Heap {
        ptr: *mut u8,
        layout: Layout,
        drop: unsafe fn(*mut u8),
    },
}

/// Downward bump region at the head of a fiber's storage.
///
/// Staging places the descriptor copy at the top and the callable clone
/// below it on a 16-byte boundary, mirroring how a call frame would sit on
/// the fiber's stack.
pub(crate) struct DetachArena {
    buf: DetachBuf,
    clone: Option<CloneSlot>,
    staged: bool,
}

impl DetachArena {
    fn new() -> Self {
        DetachArena {
            buf: DetachBuf([MaybeUninit::uninit(); DETACH_BYTES]),
            clone: None,
            staged: false,
        }
    }

    /// Copy `job` into the arena and clone its callable, returning the
    /// staged descriptor. After this the caller's descriptor and callable
    /// may be dropped.
    fn stage(&mut self, job: &Job<'_>) -> *const Job<'static> {
        debug_assert!(!self.staged, "fiber already hosts a staged job");

        let base = self.buf.0.as_mut_ptr() as *mut u8;
        let top = DETACH_BYTES - std::mem::size_of::<Job>();
        let staged = unsafe {
            let dst = base.add(top) as *mut Job<'static>;
            std::ptr::copy_nonoverlapping(
                job as *const Job as *const u8,
                dst as *mut u8,
                std::mem::size_of::<Job>(),
            );
            dst
        };

        let vtable = job.vtable;
        if vtable.layout.size() > 0 {
            let size = vtable.layout.size();
            let align = vtable.layout.align().max(16);
            if size <= top {
                let offset = (top - size) & !(align - 1);
                let clone = unsafe { base.add(offset) };
                unsafe {
                    (vtable.clone_into)(job.callable, clone);
                    (*staged).callable = clone as *const ();
                }
                self.clone = Some(CloneSlot::Inline {
                    ptr: clone,
                    drop: vtable.drop_clone,
                });
            } else {
                // Fallback allocator for oversized callables.
                let clone = unsafe { alloc(vtable.layout) };
                if clone.is_null() {
                    handle_alloc_error(vtable.layout);
                }
                unsafe {
                    (vtable.clone_into)(job.callable, clone);
                    (*staged).callable = clone as *const ();
                }
                self.clone = Some(CloneSlot::Heap {
                    ptr: clone,
                    layout: vtable.layout,
                    drop: vtable.drop_clone,
                });
            }
        }

        self.staged = true;
        staged as *const Job<'static>
    }

    /// Destroy any staged clone and make the arena reusable.
    fn reset(&mut self) {
        if let Some(slot) = self.clone.take() {
            match slot {
                CloneSlot::Inline { ptr, drop } => unsafe { drop(ptr) },
                CloneSlot::Heap { ptr, layout, drop } => unsafe {
                    drop(ptr);
                    dealloc(ptr, layout);
                },
            }
        }
        self.staged = false;
    }
}

/// A pooled fiber: a one-shot trampoline coroutine on a 64 KiB stack, plus
/// detach storage for async submissions.
///
/// Fiber identity is stable (its address in the pool); it carries no state
/// between activations.
pub(crate) struct Fiber {
    trampoline: Option<Coroutine<JobPtr, (), ()>>,
    arena: DetachArena,
}

impl Fiber {
    pub(crate) fn new() -> Self {
        Fiber {
            trampoline: None,
            arena: DetachArena::new(),
        }
    }

    /// Set up a fresh trampoline on a new 64 KiB stack. The pool prepares
    /// every fiber at construction and again on release, so a free fiber is
    /// always ready to run.
    pub(crate) fn prepare(&mut self) {
        let stack = DefaultStack::new(STACK_SIZE).expect("failed to allocate fiber stack");
        self.trampoline = Some(Coroutine::with_stack(stack, |_, job: JobPtr| {
            // Trampoline: run the callable on this fiber's stack, then fall
            // off the end, which switches back to whoever resumed us.
            unsafe { (*job.0).invoke() }
        }));
    }

    /// Stage a descriptor copy for detached execution. See [`DetachArena`].
    pub(crate) fn stage(&mut self, job: &Job<'_>) -> *const Job<'static> {
        self.arena.stage(job)
    }

    /// Switch onto the fiber and run `job` to completion. Returns the panic
    /// payload if the callable panicked.
    pub(crate) fn run(&mut self, job: JobPtr) -> Result<(), Box<dyn Any + Send>> {
        let trampoline = self
            .trampoline
            .as_mut()
            .expect("fiber activated without a prepared trampoline");

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| trampoline.resume(job)));
        self.trampoline = None;

        match outcome {
            Ok(CoroutineResult::Return(())) => Ok(()),
            Ok(CoroutineResult::Yield(())) => {
                unreachable!("job trampolines run to completion and never yield")
            }
            Err(payload) => Err(payload),
        }
    }

    /// Tear down per-activation state and ready the next trampoline before
    /// the fiber re-enters the free pool.
    pub(crate) fn release(&mut self) {
        self.arena.reset();
        self.prepare();
    }
}
