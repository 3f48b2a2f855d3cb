//! Job descriptors.
//!
//! A [`Job`] is a fixed 64-byte record, one cache line, so that a batch of
//! descriptors never puts two cores on the same line. It holds a non-owning
//! reference to a callable plus a type-erased argument; the rest of the line
//! is payload space the argument can live in when it fits.
//!
//! The callable reference is two words: a data pointer to the caller's
//! closure and a pointer to a static vtable generated per closure type. The
//! vtable also carries the clone protocol used by [`crate::submit_async`] to
//! detach a descriptor from its submitter: how large the closure is, how to
//! clone it into fiber-owned storage, and how to drop the clone later.

use std::alloc::Layout;
use std::marker::PhantomData;
use std::mem::MaybeUninit;

/// Payload bytes left in the descriptor after the callable reference and the
/// argument. Everything is sized so the whole record is exactly 64 bytes.
const PAYLOAD_BYTES: usize = 39;

/// A type-erased borrowed argument, passed to every job callable.
///
/// This is a thin pointer with no runtime type information; [`AnyRef::get`]
/// is unchecked and the submitter and callable must agree on the type.
#[derive(Clone, Copy)]
pub struct AnyRef<'a> {
    ptr: *const (),
    _borrow: PhantomData<&'a ()>,
}

impl<'a> AnyRef<'a> {
    /// Borrow `value` as a type-erased argument.
    pub fn new<T: Sync>(value: &'a T) -> AnyRef<'a> {
        AnyRef {
            ptr: value as *const T as *const (),
            _borrow: PhantomData,
        }
    }

    /// An empty argument, for callables that take none.
    pub const fn none() -> AnyRef<'a> {
        AnyRef {
            ptr: std::ptr::null(),
            _borrow: PhantomData,
        }
    }

    pub fn is_none(&self) -> bool {
        self.ptr.is_null()
    }

    pub(crate) const fn from_raw(ptr: *const ()) -> AnyRef<'a> {
        AnyRef {
            ptr,
            _borrow: PhantomData,
        }
    }

    /// Reborrow as a `T`.
    ///
    /// # Safety
    ///
    /// The argument must have been created from a live `&T` (or point at a
    /// payload slot holding a `T`), and `T` must be the type the submitter
    /// stored. No check is performed.
    pub unsafe fn get<T>(&self) -> &'a T {
        debug_assert!(!self.ptr.is_null(), "downcast of an empty AnyRef");
        &*(self.ptr as *const T)
    }
}

/// Per-callable-type operations, shared by every job built from the same
/// closure type.
pub(crate) struct JobVTable {
    pub(crate) call: unsafe fn(*const (), AnyRef),
    pub(crate) clone_into: unsafe fn(*const (), *mut u8),
    pub(crate) drop_clone: unsafe fn(*mut u8),
    pub(crate) layout: Layout,
}

struct VTableFor<F>(PhantomData<F>);

impl<F> VTableFor<F>
where
    F: Fn(AnyRef) + Send + Sync + Clone,
{
    const VTABLE: JobVTable = JobVTable {
        call: call_thunk::<F>,
        clone_into: clone_thunk::<F>,
        drop_clone: drop_thunk::<F>,
        layout: Layout::new::<F>(),
    };
}

unsafe fn call_thunk<F: Fn(AnyRef)>(callable: *const (), argument: AnyRef) {
    (*(callable as *const F))(argument)
}

unsafe fn clone_thunk<F: Clone>(callable: *const (), target: *mut u8) {
    let clone = (*(callable as *const F)).clone();
    (target as *mut F).write(clone);
}

unsafe fn drop_thunk<F>(clone: *mut u8) {
    std::ptr::drop_in_place(clone as *mut F)
}

/// A unit of work: callable reference, argument, and payload padding, boxed
/// into exactly one cache line.
///
/// The lifetime ties the descriptor to the callable and any borrowed
/// argument it references. The descriptor itself owns nothing: dropping it
/// is free, and for plain [`crate::submit`] the referenced callable must stay
/// alive until the batch's condition is satisfied.
#[repr(C)]
pub struct Job<'a> {
    pub(crate) callable: *const (),
    pub(crate) vtable: &'static JobVTable,
    pub(crate) argument: AnyRef<'a>,
    pub(crate) payload: [MaybeUninit<u8>; PAYLOAD_BYTES],
    pub(crate) arg_in_payload: bool,
    _borrow: PhantomData<&'a ()>,
}

const _: () = assert!(std::mem::size_of::<Job<'static>>() == 64);
const _: () = assert!(std::mem::align_of::<Job<'static>>() == 8);

impl<'a> Job<'a> {
    /// Describe a job that calls `callable` with `argument`.
    ///
    /// The callable is borrowed, not copied; `Clone` is required so the
    /// async submission path can detach a copy onto a fiber.
    pub fn new<F>(callable: &'a F, argument: AnyRef<'a>) -> Job<'a>
    where
        F: Fn(AnyRef) + Send + Sync + Clone,
    {
        Job {
            callable: callable as *const F as *const (),
            vtable: &VTableFor::<F>::VTABLE,
            argument,
            payload: [MaybeUninit::uninit(); PAYLOAD_BYTES],
            arg_in_payload: false,
            _borrow: PhantomData,
        }
    }

    /// Describe a job whose argument is stored inside the descriptor's
    /// payload bytes instead of being borrowed.
    ///
    /// The callable receives an [`AnyRef`] pointing at the stored value;
    /// because the pointer is resolved against the live descriptor at
    /// invocation time, the value travels with async descriptor copies.
    ///
    /// # Panics
    ///
    /// Panics if `T` does not fit the payload (39 bytes, alignment up to 8).
    pub fn with_value<F, T>(callable: &'a F, value: T) -> Job<'a>
    where
        F: Fn(AnyRef) + Send + Sync + Clone,
        T: Copy + Send + Sync + 'a,
    {
        assert!(
            std::mem::size_of::<T>() <= PAYLOAD_BYTES,
            "inline job argument does not fit the descriptor payload"
        );
        assert!(
            std::mem::align_of::<T>() <= 8,
            "inline job argument is over-aligned for the descriptor payload"
        );

        let mut job = Job::new(callable, AnyRef::none());
        // The payload starts at offset 24, which satisfies any alignment up
        // to 8.
        unsafe { (job.payload.as_mut_ptr() as *mut T).write(value) };
        job.arg_in_payload = true;
        job
    }

    /// Run the callable.
    ///
    /// # Safety
    ///
    /// The callable (and a borrowed argument, if any) must still be alive;
    /// this is the submission contract of [`crate::submit`] and
    /// [`crate::submit_async`].
    pub(crate) unsafe fn invoke(&self) {
        if self.arg_in_payload {
            (self.vtable.call)(
                self.callable,
                AnyRef::from_raw(self.payload.as_ptr() as *const ()),
            )
        } else {
            (self.vtable.call)(self.callable, self.argument)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn descriptor_is_one_cache_line() {
        assert_eq!(std::mem::size_of::<Job>(), 64);
    }

    #[test]
    fn invokes_with_borrowed_argument() {
        let sink = AtomicU64::new(0);
        let input: u64 = 41;

        let add_one = |arg: AnyRef| {
            let value = unsafe { arg.get::<u64>() };
            sink.store(value + 1, Ordering::Relaxed);
        };
        let job = Job::new(&add_one, AnyRef::new(&input));

        unsafe { job.invoke() };
        assert_eq!(sink.load(Ordering::Relaxed), 42);
    }

    #[test]
    fn invokes_with_inline_argument() {
        let sink = AtomicU64::new(0);

        let record = |arg: AnyRef| {
            let value = unsafe { arg.get::<u32>() };
            sink.store(*value as u64, Ordering::Relaxed);
        };
        let job = Job::with_value(&record, 7u32);

        unsafe { job.invoke() };
        assert_eq!(sink.load(Ordering::Relaxed), 7);
    }

    #[test]
    fn empty_argument_is_detectable() {
        let seen_none = AtomicU64::new(0);
        let check = |arg: AnyRef| {
            if arg.is_none() {
                seen_none.store(1, Ordering::Relaxed);
            }
        };
        let job = Job::new(&check, AnyRef::none());
        unsafe { job.invoke() };
        assert_eq!(seen_none.load(Ordering::Relaxed), 1);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn oversized_inline_argument_panics() {
        let ignore = |_: AnyRef| {};
        let _ = Job::with_value(&ignore, [0u8; 64]);
    }
}
