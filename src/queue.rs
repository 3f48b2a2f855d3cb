//! Bounded lockless MPMC queue.
//!
//! A fixed-capacity multi-producer/multi-consumer queue built on a ticket
//! protocol: every slot carries an atomic `turn` counter, and a producer or
//! consumer first claims a sequence number from the head or tail, then waits
//! for its slot's turn to come around. The queue backs the ready-job list and
//! both free pools, so it allocates only at construction.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::utils::CachePadded;

struct Slot<T> {
    /// Even turns mean the slot is empty, odd mean full. A slot at sequence
    /// `s` is writable on turn `2 * (s / capacity)` and readable on the turn
    /// after.
    turn: CachePadded<AtomicU64>,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Fixed-capacity lockless queue. Capacity is rounded up to the next power
/// of two at construction; there is no allocation afterwards.
///
/// The blocking forms (`push`/`pop`) spin until their slot frees up; the try
/// forms reserve a sequence number with a CAS and report full/empty instead.
/// Successful operations are linearized by the order of their head/tail
/// claims.
pub(crate) struct Bounded<T> {
    slots: Box<[Slot<T>]>,
    mask: u64,
    capacity: u64,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
}

unsafe impl<T: Send> Send for Bounded<T> {}
unsafe impl<T: Send> Sync for Bounded<T> {}

impl<T> Bounded<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be non-zero");
        let capacity = capacity.next_power_of_two() as u64;
        debug_assert!(capacity.is_power_of_two());

        let slots = (0..capacity)
            .map(|_| Slot {
                turn: CachePadded::new(AtomicU64::new(0)),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Bounded {
            slots,
            mask: capacity - 1,
            capacity,
            head: CachePadded::new(AtomicU64::new(0)),
            tail: CachePadded::new(AtomicU64::new(0)),
        }
    }

    #[inline]
    fn index(&self, seq: u64) -> usize {
        (seq & self.mask) as usize
    }

    #[inline]
    fn turn(&self, seq: u64) -> u64 {
        seq / self.capacity
    }

    /// Enqueue, spinning while the claimed slot still holds a value from a
    /// previous lap. Never returns without storing `value`.
    pub(crate) fn push(&self, value: T) {
        let seq = self.head.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[self.index(seq)];
        let turn = self.turn(seq) * 2;

        while slot.turn.load(Ordering::Acquire) != turn {
            std::hint::spin_loop();
        }

        unsafe { (*slot.value.get()).write(value) };
        slot.turn.store(turn + 1, Ordering::Release);
    }

    /// Dequeue, spinning until the claimed slot is filled.
    pub(crate) fn pop(&self) -> T {
        let seq = self.tail.fetch_add(1, Ordering::Relaxed);
        let slot = &self.slots[self.index(seq)];
        let turn = self.turn(seq) * 2 + 1;

        while slot.turn.load(Ordering::Acquire) != turn {
            std::hint::spin_loop();
        }

        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.turn.store(turn + 1, Ordering::Release);
        value
    }

    /// Enqueue without blocking. Returns the value back when the queue is
    /// full at the observed head.
    pub(crate) fn try_push(&self, value: T) -> Result<(), T> {
        let mut seq = self.head.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[self.index(seq)];
            if slot.turn.load(Ordering::Acquire) == self.turn(seq) * 2 {
                match self
                    .head
                    .compare_exchange(seq, seq + 1, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.turn.store(self.turn(seq) * 2 + 1, Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => seq = current,
                }
            } else {
                let prev = seq;
                seq = self.head.load(Ordering::Acquire);
                if seq == prev {
                    // Head did not move, so the slot really is occupied.
                    return Err(value);
                }
            }
        }
    }

    /// Dequeue without blocking. Returns `None` when the queue is empty at
    /// the observed tail.
    pub(crate) fn try_pop(&self) -> Option<T> {
        let mut seq = self.tail.load(Ordering::Acquire);
        loop {
            let slot = &self.slots[self.index(seq)];
            if slot.turn.load(Ordering::Acquire) == self.turn(seq) * 2 + 1 {
                match self
                    .tail
                    .compare_exchange(seq, seq + 1, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.turn.store(self.turn(seq) * 2 + 2, Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => seq = current,
                }
            } else {
                let prev = seq;
                seq = self.tail.load(Ordering::Acquire);
                if seq == prev {
                    return None;
                }
            }
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

impl<T> Drop for Bounded<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let queue = Bounded::new(8);
        for i in 0..8 {
            queue.push(i);
        }
        for i in 0..8 {
            assert_eq!(queue.pop(), i);
        }
    }

    #[test]
    fn capacity_rounds_to_power_of_two() {
        let queue: Bounded<u32> = Bounded::new(48);
        assert_eq!(queue.capacity(), 64);
        let queue: Bounded<u32> = Bounded::new(16);
        assert_eq!(queue.capacity(), 16);
    }

    #[test]
    fn try_pop_empty() {
        let queue: Bounded<u32> = Bounded::new(4);
        assert_eq!(queue.try_pop(), None);
        queue.push(7);
        assert_eq!(queue.try_pop(), Some(7));
        assert_eq!(queue.try_pop(), None);
    }

    #[test]
    fn try_push_full() {
        let queue = Bounded::new(4);
        for i in 0..4 {
            assert!(queue.try_push(i).is_ok());
        }
        assert_eq!(queue.try_push(99), Err(99));
        assert_eq!(queue.try_pop(), Some(0));
        assert!(queue.try_push(99).is_ok());
    }

    #[test]
    fn wraparound_reuses_slots() {
        let queue = Bounded::new(4);
        for lap in 0..10 {
            for i in 0..4 {
                queue.push(lap * 4 + i);
            }
            for i in 0..4 {
                assert_eq!(queue.pop(), lap * 4 + i);
            }
        }
    }

    #[test]
    fn blocking_push_waits_for_drain() {
        let queue = Arc::new(Bounded::new(2));
        queue.push(1);
        queue.push(2);

        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.push(3))
        };

        // Give the producer time to hit the full queue and start spinning.
        thread::sleep(std::time::Duration::from_millis(20));
        assert_eq!(queue.pop(), 1);

        producer.join().unwrap();
        assert_eq!(queue.pop(), 2);
        assert_eq!(queue.pop(), 3);
    }

    /// Every completed push is popped exactly once, regardless of the
    /// producer/consumer interleaving.
    #[test]
    fn mpmc_stress_no_loss_no_duplicates() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 2_000;

        let queue = Arc::new(Bounded::new(64));
        let popped = Arc::new(AtomicUsize::new(0));
        let seen: Arc<Vec<AtomicUsize>> = Arc::new(
            (0..PRODUCERS * PER_PRODUCER)
                .map(|_| AtomicUsize::new(0))
                .collect(),
        );

        let mut handles = Vec::new();
        for p in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            handles.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    queue.push(p * PER_PRODUCER + i);
                }
            }));
        }
        for _ in 0..CONSUMERS {
            let queue = Arc::clone(&queue);
            let popped = Arc::clone(&popped);
            let seen = Arc::clone(&seen);
            handles.push(thread::spawn(move || loop {
                if popped.load(Ordering::Relaxed) >= PRODUCERS * PER_PRODUCER {
                    break;
                }
                if let Some(value) = queue.try_pop() {
                    seen[value].fetch_add(1, Ordering::Relaxed);
                    popped.fetch_add(1, Ordering::Relaxed);
                } else {
                    std::hint::spin_loop();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(popped.load(Ordering::Relaxed), PRODUCERS * PER_PRODUCER);
        for slot in seen.iter() {
            assert_eq!(slot.load(Ordering::Relaxed), 1);
        }
    }

    #[test]
    fn drop_runs_destructors_of_queued_values() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue = Bounded::new(4);
            queue.push(Tracked(Arc::clone(&drops)));
            queue.push(Tracked(Arc::clone(&drops)));
            let first = queue.pop();
            drop(first);
            assert_eq!(drops.load(Ordering::Relaxed), 1);
        }
        assert_eq!(drops.load(Ordering::Relaxed), 2);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Push(u32),
        Pop,
    }

    proptest! {
        /// Single-threaded, the queue behaves exactly like a capacity-capped
        /// VecDeque: same values out, same full/empty verdicts.
        #[test]
        fn matches_deque_model(
            capacity in 1usize..32,
            ops in prop::collection::vec(
                prop_oneof![any::<u32>().prop_map(Op::Push), Just(Op::Pop)],
                0..200,
            ),
        ) {
            let queue = Bounded::new(capacity);
            let rounded = queue.capacity();
            let mut model: VecDeque<u32> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Push(value) => {
                        let accepted = queue.try_push(value).is_ok();
                        prop_assert_eq!(accepted, model.len() < rounded);
                        if accepted {
                            model.push_back(value);
                        }
                    }
                    Op::Pop => {
                        prop_assert_eq!(queue.try_pop(), model.pop_front());
                    }
                }
            }

            for expected in model {
                prop_assert_eq!(queue.try_pop(), Some(expected));
            }
            prop_assert_eq!(queue.try_pop(), None);
        }
    }
}
