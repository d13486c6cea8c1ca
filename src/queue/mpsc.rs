//! Lock-free bounded multi-producer single-consumer ring.
//!
//! Vyukov's bounded MPMC queue, simplified for a single consumer. Each slot
//! carries an atomic sequence counter used for coordination:
//! - Producers CAS on `tail` to claim a slot, write the payload, then
//!   publish by storing the sequence.
//! - The consumer owns `head` (no CAS), checks the sequence, moves the
//!   payload out, and reclaims the slot by storing `sequence = pos + K`.
//!
//! Memory ordering: acquire on every sequence read, release on every
//! sequence write (payload visibility), acquire-release on the `tail` CAS
//! (producer-to-producer ordering). `head` and `tail` are cache-line
//! isolated from each other and from the slot array.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

pub struct MpscRing<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    slots: Box<[Slot<T>]>,
    mask: usize,
}

// Payloads move through by value; the sequence protocol serializes access to
// each slot's cell.
unsafe impl<T: Send> Send for MpscRing<T> {}
unsafe impl<T: Send> Sync for MpscRing<T> {}

impl<T> MpscRing<T> {
    /// Capacity must be a power of two so indices reduce with a mask.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 2, "ring capacity must be at least 2");
        assert!(
            capacity.is_power_of_two(),
            "ring capacity must be a power of two"
        );

        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            slots,
            mask: capacity - 1,
        }
    }

    /// Push from any producer thread. Returns the value back when the ring
    /// is full; the caller decides what a drop means.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut pos = self.tail.load(Ordering::Relaxed);

        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;

            if diff == 0 {
                // Slot is writable; race the other producers for it.
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence
                            .store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    // Another producer claimed it; retry at its position.
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                // Consumer has not reclaimed this slot yet: full.
                return Err(value);
            } else {
                // Claimed but not yet published by another producer.
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Pop the next value. Single consumer only: exactly one thread may call
    /// this for the lifetime of the ring.
    pub fn try_pop(&self) -> Option<T> {
        let pos = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[pos & self.mask];
        let seq = slot.sequence.load(Ordering::Acquire);
        let diff = seq as isize - pos.wrapping_add(1) as isize;

        if diff < 0 {
            // Empty, or a producer claimed the slot but has not published.
            return None;
        }

        let value = unsafe { (*slot.value.get()).assume_init_read() };
        // Reclaim for the K-th future wraparound.
        slot.sequence
            .store(pos.wrapping_add(self.capacity()), Ordering::Release);
        self.head.store(pos.wrapping_add(1), Ordering::Relaxed);
        Some(value)
    }

    /// Unconsumed element count. Approximate under concurrent access.
    #[inline]
    pub fn len(&self) -> usize {
        let tail = self.tail.load(Ordering::Acquire);
        let head = self.head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }
}

impl<T> Drop for MpscRing<T> {
    fn drop(&mut self) {
        while self.try_pop().is_some() {}
    }
}
