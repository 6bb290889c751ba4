//! Medium tier: a buddy allocator over ten power-of-two orders.
//!
//! Orders span 1 MiB (`order 0`) to 512 MiB (`order 9`); a block of order
//! `o` spans `1 MiB << o` bytes including its header. Each order has a
//! lock-free tagged free stack, indexed by a 16-bit occupancy bitmap for
//! O(1) next-level search. Frees enqueue coalescing work onto a bounded
//! ring consumed by a single detached worker; a full ring degrades to a
//! synchronous merge on the freeing thread.

pub(crate) mod merge;

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::layout::{MediumHeader, DEFAULT_ALIGNMENT, MEDIUM_HEADER_BYTES, MEDIUM_MAGIC};
use crate::os;
use crate::tagged::TaggedHead;

use merge::{MergeQueue, MergeRequest};

/// Number of buddy orders.
pub(crate) const ORDER_COUNT: usize = 10;

const MIN_BLOCK_BYTES: usize = 1 << 20;

/// Total bytes (header included) of a block at `order`.
pub(crate) const fn order_bytes(order: usize) -> usize {
    MIN_BLOCK_BYTES << order
}

/// Smallest order whose block holds `bytes`, or `None` above order 9.
pub(crate) fn order_of(bytes: usize) -> Option<usize> {
    let need = bytes.max(MIN_BLOCK_BYTES);
    let mut order = 0;
    let mut capacity = MIN_BLOCK_BYTES;
    while capacity < need {
        order += 1;
        if order >= ORDER_COUNT {
            return None;
        }
        capacity <<= 1;
    }
    Some(order)
}

/// Shared buddy state; the merge worker holds its own `Arc`.
pub(crate) struct MediumInner {
    free_lists: [TaggedHead<MediumHeader>; ORDER_COUNT],
    /// Bit `o` set means `free_lists[o]` is believed non-empty. Advisory:
    /// set before a push becomes observable, cleared when a pop observes
    /// emptiness.
    occupied: AtomicU16,
    queue: MergeQueue,
    worker_active: AtomicBool,
    /// `(base, bytes)` of every chunk mapped for this tier.
    chunks: Mutex<Vec<(usize, usize)>>,
}

pub(crate) struct MediumTier {
    inner: Arc<MediumInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
    released: AtomicBool,
}

impl MediumTier {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(MediumInner {
                free_lists: core::array::from_fn(|_| TaggedHead::new()),
                occupied: AtomicU16::new(0),
                queue: MergeQueue::new(),
                worker_active: AtomicBool::new(false),
                chunks: Mutex::new(Vec::new()),
            }),
            worker: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// Serves `bytes` of payload. Returns the payload pointer, or `None`
    /// when the request exceeds order 9 or the OS refuses a chunk.
    pub(crate) fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let want = order_of(bytes.checked_add(MEDIUM_HEADER_BYTES)?)?;
        loop {
            // 1) Same or higher order, splitting down as needed.
            for order in want..ORDER_COUNT {
                if let Some(block) = self.inner.pop_block(order) {
                    let block = if order > want {
                        unsafe { self.inner.split_to_order(block, order, want) }
                    } else {
                        block
                    };
                    return Some(unsafe { Self::finish_allocation(block, want) });
                }
            }

            // 2) Fresh chunk sized for the request.
            let chunk_bytes = order_bytes(want);
            let chunk = {
                let mut chunks = self.inner.chunks.lock().unwrap();
                let chunk = os::allocate_tracked(chunk_bytes, DEFAULT_ALIGNMENT)?;
                chunks.push((chunk.as_ptr() as usize, chunk_bytes));
                chunk.as_ptr()
            };
            log::trace!("medium refill: order {want} chunk ({chunk_bytes} B)");
            let header = chunk.cast::<MediumHeader>();
            unsafe {
                header.write(MediumHeader {
                    magic: MEDIUM_MAGIC,
                    block_size: chunk_bytes,
                    is_free: AtomicBool::new(true),
                    next: AtomicPtr::new(ptr::null_mut()),
                });
            }

            if self.inner.occupied.load(Ordering::Acquire) != 0 {
                // Some list regained blocks while we were mapping; prefer
                // tier memory, publish the fresh block, and rescan.
                self.inner.push_block(header, want);
                continue;
            }
            return Some(unsafe { Self::finish_allocation(header, want) });
        }
    }

    /// Returns a block to the tier and schedules buddy coalescing.
    pub(crate) fn deallocate(&self, header: *mut MediumHeader) {
        unsafe {
            if (*header)
                .is_free
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // Double free.
                return;
            }
            if (*header).magic != MEDIUM_MAGIC {
                log::error!("medium block {header:p} dropped: corrupted header magic");
                return;
            }
            let Some(order) = order_of((*header).block_size) else {
                log::error!("medium block {header:p} dropped: impossible size");
                return;
            };

            if !self.inner.queue.push(MergeRequest {
                block: header,
                order,
            }) {
                // Ring full: merge on this thread.
                self.inner.try_merge_buddy(header, order);
                return;
            }
        }
        self.ensure_worker();
    }

    /// Joins the merge worker and drains any remaining requests.
    pub(crate) fn quiesce(&self) {
        let handle = self.worker.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        while let Some(request) = self.inner.queue.pop() {
            unsafe { self.inner.try_merge_buddy(request.block, request.order) };
        }
    }

    /// Quiesces the worker, zeroes every per-order head, and returns all
    /// chunks to the OS. Idempotent.
    pub(crate) fn release_resources(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.quiesce();
        for list in &self.inner.free_lists {
            unsafe { list.take_all() };
        }
        self.inner.occupied.store(0, Ordering::Relaxed);

        let mut chunks = self.inner.chunks.lock().unwrap();
        for &(base, bytes) in chunks.iter() {
            unsafe { os::deallocate_tracked(base as *mut u8, bytes) };
        }
        chunks.clear();
    }

    fn ensure_worker(&self) {
        if self
            .inner
            .worker_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = Arc::clone(&self.inner);
            let mut slot = self.worker.lock().unwrap();
            // The previous worker saw an empty ring and is exiting; joining
            // it here keeps at most one worker alive.
            if let Some(old) = slot.take() {
                let _ = old.join();
            }
            *slot = Some(std::thread::spawn(move || worker_loop(&inner)));
        }
    }

    unsafe fn finish_allocation(block: *mut MediumHeader, order: usize) -> NonNull<u8> {
        (*block).magic = MEDIUM_MAGIC;
        (*block).block_size = order_bytes(order);
        (*block).is_free.store(false, Ordering::Relaxed);
        (*block).next.store(ptr::null_mut(), Ordering::Relaxed);
        NonNull::new_unchecked(MediumHeader::data(block))
    }
}

fn worker_loop(inner: &MediumInner) {
    loop {
        match inner.queue.pop() {
            Some(request) => unsafe { inner.try_merge_buddy(request.block, request.order) },
            None => {
                inner.worker_active.store(false, Ordering::Release);
                // A producer may have enqueued between the failed pop and
                // the store; reclaim the flag or leave the ring to the
                // worker that producer spawns.
                if inner.queue.is_empty() {
                    return;
                }
                if inner
                    .worker_active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

impl MediumInner {
    fn push_block(&self, header: *mut MediumHeader, order: usize) {
        unsafe {
            (*header).next.store(ptr::null_mut(), Ordering::Relaxed);
            (*header).block_size = order_bytes(order);
            (*header).is_free.store(true, Ordering::Release);
            // Bit set must precede the node becoming observable.
            self.occupied.fetch_or(1 << order, Ordering::AcqRel);
            self.free_lists[order].push(header);
        }
    }

    fn pop_block(&self, order: usize) -> Option<*mut MediumHeader> {
        loop {
            match unsafe { self.free_lists[order].pop() } {
                Some((block, drained)) => {
                    if drained {
                        self.occupied.fetch_and(!(1u16 << order), Ordering::AcqRel);
                    }
                    let block = block.as_ptr();
                    // Best-effort interior removal can leave a consumed
                    // buddy linked; gate on the free-block invariants.
                    let valid = unsafe {
                        (*block).is_free.load(Ordering::Acquire)
                            && (*block).block_size == order_bytes(order)
                    };
                    if valid {
                        return Some(block);
                    }
                    log::trace!("discarding stale order-{order} free-list entry");
                }
                None => {
                    self.occupied.fetch_and(!(1u16 << order), Ordering::AcqRel);
                    return None;
                }
            }
        }
    }

    /// Splits `block` down from `from` to `to`, publishing every right
    /// half on the free list of its order.
    unsafe fn split_to_order(
        &self,
        block: *mut MediumHeader,
        from: usize,
        to: usize,
    ) -> *mut MediumHeader {
        for order in (to..from).rev() {
            let half = order_bytes(order);
            let right = block.cast::<u8>().add(half).cast::<MediumHeader>();
            right.write(MediumHeader {
                magic: MEDIUM_MAGIC,
                block_size: half,
                is_free: AtomicBool::new(true),
                next: AtomicPtr::new(ptr::null_mut()),
            });
            self.push_block(right, order);
            (*block).block_size = half;
        }
        block
    }

    /// Coalesces `block` with free buddies as far up as possible, then
    /// publishes the result. Merging is best-effort: any verification
    /// failure stops the climb and publishes what was gathered.
    unsafe fn try_merge_buddy(&self, block: *mut MediumHeader, order: usize) {
        let address = block as usize;
        let located = {
            let chunks = self.chunks.lock().unwrap();
            chunks
                .iter()
                .find(|&&(base, bytes)| address >= base && address < base + bytes)
                .copied()
        };
        let Some((chunk_base, chunk_bytes)) = located else {
            return;
        };

        let mut block = block;
        let mut order = order;
        while order < ORDER_COUNT - 1 {
            let offset = block as usize - chunk_base;
            let buddy_offset = offset ^ order_bytes(order);
            if buddy_offset + order_bytes(order) > chunk_bytes {
                // Buddy lies outside the owning chunk.
                break;
            }
            let buddy = (chunk_base + buddy_offset) as *mut MediumHeader;
            if !(*buddy).is_free.load(Ordering::Acquire)
                || (*buddy).block_size != order_bytes(order)
            {
                break;
            }
            if !self.free_lists[order].remove(buddy) {
                break;
            }
            // A racing consumer may have claimed the buddy between the
            // check and the removal; re-verify before committing.
            if !(*buddy).is_free.load(Ordering::Acquire)
                || (*buddy).block_size != order_bytes(order)
            {
                self.push_block(buddy, order);
                break;
            }
            block = if offset < buddy_offset { block } else { buddy };
            (*block).block_size = order_bytes(order + 1);
            order += 1;
        }
        self.push_block(block, order);
    }
}

impl Drop for MediumTier {
    fn drop(&mut self) {
        self.release_resources();
    }
}
