//! Bounded merge-request ring.
//!
//! Deallocating threads enqueue `(block, order)` pairs; a single worker
//! consumes them. Multiple producers reserve slots by CAS on the tail, so
//! each slot carries its own sequence word to publish the write (a full
//! head/tail pair alone cannot tell a reserved-but-unwritten slot from a
//! written one).

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::layout::MediumHeader;

/// Capacity of the ring; must be a power of two.
pub(crate) const MERGE_QUEUE_SIZE: usize = 128;

#[derive(Clone, Copy)]
pub(crate) struct MergeRequest {
    pub(crate) block: *mut MediumHeader,
    pub(crate) order: usize,
}

unsafe impl Send for MergeRequest {}

struct Slot {
    sequence: AtomicUsize,
    request: UnsafeCell<MaybeUninit<MergeRequest>>,
}

pub(crate) struct MergeQueue {
    slots: [Slot; MERGE_QUEUE_SIZE],
    /// Next position to consume; owned by the single worker.
    head: AtomicUsize,
    /// Next position to produce; contended by deallocating threads.
    tail: AtomicUsize,
}

unsafe impl Sync for MergeQueue {}

impl MergeQueue {
    pub(crate) fn new() -> Self {
        Self {
            slots: core::array::from_fn(|position| Slot {
                sequence: AtomicUsize::new(position),
                request: UnsafeCell::new(MaybeUninit::uninit()),
            }),
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Enqueues a request. Returns `false` when the ring is full, in which
    /// case the caller merges synchronously.
    pub(crate) fn push(&self, request: MergeRequest) -> bool {
        let mut position = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[position & (MERGE_QUEUE_SIZE - 1)];
            let sequence = slot.sequence.load(Ordering::Acquire);
            let difference = sequence as isize - position as isize;
            if difference == 0 {
                match self.tail.compare_exchange_weak(
                    position,
                    position.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        unsafe { (*slot.request.get()).write(request) };
                        slot.sequence.store(position.wrapping_add(1), Ordering::Release);
                        return true;
                    }
                    Err(actual) => position = actual,
                }
            } else if difference < 0 {
                return false;
            } else {
                position = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues the oldest request. Single-consumer only.
    pub(crate) fn pop(&self) -> Option<MergeRequest> {
        let position = self.head.load(Ordering::Relaxed);
        let slot = &self.slots[position & (MERGE_QUEUE_SIZE - 1)];
        let sequence = slot.sequence.load(Ordering::Acquire);
        if sequence == position.wrapping_add(1) {
            self.head.store(position.wrapping_add(1), Ordering::Relaxed);
            let request = unsafe { (*slot.request.get()).assume_init() };
            slot.sequence
                .store(position.wrapping_add(MERGE_QUEUE_SIZE), Ordering::Release);
            Some(request)
        } else {
            None
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == self.tail.load(Ordering::Acquire)
    }
}
