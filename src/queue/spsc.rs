//! Bounded single-producer single-consumer ring.
//!
//! Used for the worker's compute→I/O completion hand-off: each compute thread owns the producer
//! side of its own ring and the I/O thread drains all of them, so both ends stay single-threaded.
//! The producer publishes with a release store on `head`, the consumer with a release store on
//! `tail`; nothing allocates after construction.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct SpscRing<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    mask: usize,
    head: AtomicUsize,
    tail: AtomicUsize,
}

// One producer and one consumer thread may touch disjoint slots concurrently.
unsafe impl<T: Send> Sync for SpscRing<T> {}

impl<T> SpscRing<T> {
    /// Create a ring with the given capacity, which must be a power of two.
    /// One slot is sacrificed to distinguish full from empty.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        Self {
            slots: (0..capacity)
                .map(|_| UnsafeCell::new(None))
                .collect::<Vec<_>>()
                .into_boxed_slice(),
            mask: capacity - 1,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Producer side. Returns the item back when the ring is full.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let head = self.head.load(Ordering::Relaxed);
        let next = (head + 1) & self.mask;
        if next == self.tail.load(Ordering::Acquire) {
            return Err(item);
        }
        unsafe {
            *self.slots[head].get() = Some(item);
        }
        self.head.store(next, Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    pub fn try_pop(&self) -> Option<T> {
        let tail = self.tail.load(Ordering::Relaxed);
        if tail == self.head.load(Ordering::Acquire) {
            return None;
        }
        let item = unsafe { (*self.slots[tail].get()).take() };
        self.tail.store((tail + 1) & self.mask, Ordering::Release);
        item
    }

    /// Approximate occupancy; exact only when called from one of the two ends.
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        (head.wrapping_sub(tail)) & self.mask
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}
