//! Small tier: 64 size classes, thread-local stacks, global ABA-safe stacks.
//!
//! Allocation tries the caller's thread cache, then the class's global
//! tagged stack, and finally carves a fresh OS chunk into an intrusive
//! chain of blocks. Deallocation claims the block via the free-flag CAS,
//! parks it in the thread cache, and batch-flushes the cache to the global
//! stacks every [`tls::FLUSH_THRESHOLD`] frees.

pub(crate) mod size_class;
pub(crate) mod tls;

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::layout::{SmallHeader, DEFAULT_ALIGNMENT, SMALL_HEADER_BYTES, SMALL_MAGIC};
use crate::os::{self, align_up};
use crate::tagged::{FreeNode, TaggedHead};

use size_class::{bucket_index, BUCKET_COUNT, BUCKET_SIZES};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Shared small-tier state; thread caches reach it through the live-pool
/// registry, so it lives behind an `Arc`.
pub(crate) struct SmallInner {
    pool_id: u64,
    buckets: [TaggedHead<SmallHeader>; BUCKET_COUNT],
    /// `(base, bytes)` of every chunk mapped for this tier.
    chunks: Mutex<Vec<(usize, usize)>>,
}

pub(crate) struct SmallTier {
    inner: Arc<SmallInner>,
    released: AtomicBool,
}

impl SmallTier {
    pub(crate) fn new() -> Self {
        let inner = Arc::new(SmallInner {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            buckets: core::array::from_fn(|_| TaggedHead::new()),
            chunks: Mutex::new(Vec::new()),
        });
        tls::register_pool(inner.pool_id, Arc::downgrade(&inner));
        Self {
            inner,
            released: AtomicBool::new(false),
        }
    }

    /// Serves `bytes` of payload from the matching size class. Returns the
    /// payload pointer, or `None` when the OS refuses a refill.
    pub(crate) fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let index = bucket_index(bytes.max(1));

        // 1) Thread-local stack.
        let cached = tls::with_cache(self.inner.pool_id, |cache| cache.pop(index)).flatten();
        if let Some(header) = cached {
            return Some(unsafe { Self::finish_allocation(header) });
        }

        // 2) Global tagged stack.
        if let Some((header, _)) = unsafe { self.inner.buckets[index].pop() } {
            return Some(unsafe { Self::finish_allocation(header.as_ptr()) });
        }

        // 3) Fresh chunk from the OS.
        self.refill(index)
    }

    /// Returns a block to the tier. With `bypass_tls` the block goes
    /// straight to the global stack (teardown path).
    pub(crate) fn deallocate(&self, header: *mut SmallHeader, bypass_tls: bool) {
        unsafe {
            if (*header)
                .is_free
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
            {
                // Double free; dropping it is safer than acting on it.
                return;
            }
            if (*header).in_tls.load(Ordering::Acquire) == 1 {
                return;
            }
            if (*header).magic != SMALL_MAGIC {
                log::error!(
                    "small block {header:p} ({} B) dropped: corrupted header magic",
                    (*header).block_size
                );
                return;
            }
            (*header).magic = 0;
            let index = (*header).bucket_index as usize;

            if bypass_tls {
                self.inner.buckets[index].push(header);
                return;
            }

            let inner = &self.inner;
            (*header).in_tls.store(1, Ordering::Release);
            let parked = tls::with_cache(inner.pool_id, |cache| {
                cache.push(index, header);
                cache.deallocation_count += 1;
                if cache.deallocation_count >= tls::FLUSH_THRESHOLD {
                    inner.flush_contents(cache);
                }
            });
            if parked.is_none() {
                // Thread-local storage is tearing down; skip the cache.
                (*header).in_tls.store(0, Ordering::Relaxed);
                self.inner.buckets[index].push(header);
            }
        }
    }

    /// Flushes the calling thread's cache into the global stacks.
    pub(crate) fn flush_current_thread(&self) {
        let inner = &self.inner;
        tls::with_cache(inner.pool_id, |cache| inner.flush_contents(cache));
    }

    /// Flushes the calling thread, returns every chunk to the OS, and
    /// zeroes the global stacks. Idempotent.
    pub(crate) fn release_resources(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush_current_thread();
        // After this no thread cache can flush into the tier anymore.
        tls::unregister_pool(self.inner.pool_id);

        let mut chunks = self.inner.chunks.lock().unwrap();
        for &(base, bytes) in chunks.iter() {
            unsafe { os::deallocate_tracked(base as *mut u8, bytes) };
        }
        chunks.clear();
        drop(chunks);

        for bucket in &self.inner.buckets {
            // Only detaches the head word; the nodes are already unmapped.
            unsafe { bucket.take_all() };
        }
    }

    unsafe fn finish_allocation(header: *mut SmallHeader) -> NonNull<u8> {
        (*header).magic = SMALL_MAGIC;
        (*header).is_free.store(false, Ordering::Relaxed);
        (*header).in_tls.store(0, Ordering::Relaxed);
        NonNull::new_unchecked(SmallHeader::data(header))
    }

    fn refill(&self, index: usize) -> Option<NonNull<u8>> {
        let class_bytes = BUCKET_SIZES[index];
        let block_bytes = align_up(SMALL_HEADER_BYTES + class_bytes, DEFAULT_ALIGNMENT);
        let chunk_bytes = (1usize << 20).max(block_bytes * 128);

        let chunk = {
            let mut chunks = self.inner.chunks.lock().unwrap();
            let chunk = os::allocate_tracked(chunk_bytes, DEFAULT_ALIGNMENT)?;
            chunks.push((chunk.as_ptr() as usize, chunk_bytes));
            chunk.as_ptr()
        };

        let block_count = chunk_bytes / block_bytes;
        if block_count == 0 {
            let mut chunks = self.inner.chunks.lock().unwrap();
            chunks.retain(|&(base, _)| base != chunk as usize);
            drop(chunks);
            unsafe { os::deallocate_tracked(chunk, chunk_bytes) };
            return None;
        }
        log::trace!("small refill: class {index} ({class_bytes} B), {block_count} blocks");

        // Carve the chunk into a forward-linked chain.
        unsafe {
            let mut previous: *mut SmallHeader = ptr::null_mut();
            for block in (0..block_count).rev() {
                let header = chunk.add(block * block_bytes).cast::<SmallHeader>();
                header.write(SmallHeader {
                    magic: SMALL_MAGIC,
                    bucket_index: index as u32,
                    block_size: class_bytes as u32,
                    is_free: AtomicBool::new(true),
                    in_tls: AtomicU8::new(0),
                    next: AtomicPtr::new(previous),
                });
                // The tail padding sits exactly where deallocation probes
                // for the alignment sentinel; it must never read as one.
                header
                    .cast::<u8>()
                    .add(core::mem::size_of::<SmallHeader>() - 8)
                    .write_bytes(0, 8);
                previous = header;
            }

            let first = chunk.cast::<SmallHeader>();
            if block_count > 1 {
                let second = SmallHeader::link_of(first);
                let last = chunk.add((block_count - 1) * block_bytes).cast::<SmallHeader>();
                self.inner.buckets[index].splice(second, last);
            }
            Some(Self::finish_allocation(first))
        }
    }
}

impl SmallInner {
    /// Migrates every non-empty class stack of `cache` to the global
    /// stacks. The chain is detached first and `in_tls` cleared while the
    /// chain is still private; only then is it published, so no other
    /// thread can recycle a node that still carries the TLS mark.
    pub(crate) fn flush_contents(&self, cache: &mut tls::ThreadCache) {
        for index in 0..BUCKET_COUNT {
            let head = cache.detach(index);
            if head.is_null() {
                continue;
            }
            unsafe {
                let mut tail = head;
                loop {
                    (*tail).in_tls.store(0, Ordering::Relaxed);
                    let next = SmallHeader::link_of(tail);
                    if next.is_null() {
                        break;
                    }
                    tail = next;
                }
                self.buckets[index].splice(head, tail);
            }
        }
        cache.deallocation_count = 0;
    }
}

impl Drop for SmallTier {
    fn drop(&mut self) {
        self.release_resources();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wipe(ptr: NonNull<u8>, len: usize, value: u8) {
        unsafe { ptr.as_ptr().write_bytes(value, len) };
    }

    #[test]
    fn same_thread_reuse_is_lifo() {
        let tier = SmallTier::new();
        let first = tier.allocate(64).unwrap();
        wipe(first, 64, 0xA5);
        unsafe { tier.deallocate(first.as_ptr().sub(SMALL_HEADER_BYTES).cast(), false) };
        let second = tier.allocate(64).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn distinct_live_blocks() {
        let tier = SmallTier::new();
        let a = tier.allocate(24).unwrap();
        let b = tier.allocate(24).unwrap();
        let c = tier.allocate(24).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        wipe(a, 24, 1);
        wipe(b, 24, 2);
        wipe(c, 24, 3);
        unsafe {
            assert_eq!(a.as_ptr().read(), 1);
            assert_eq!(b.as_ptr().read(), 2);
            assert_eq!(c.as_ptr().read(), 3);
        }
    }

    #[test]
    fn double_free_is_absorbed() {
        let tier = SmallTier::new();
        let ptr = tier.allocate(128).unwrap();
        let header = unsafe { ptr.as_ptr().sub(SMALL_HEADER_BYTES).cast::<SmallHeader>() };
        tier.deallocate(header, false);
        tier.deallocate(header, false);
        // The block is reusable exactly once.
        let again = tier.allocate(128).unwrap();
        assert_eq!(again, ptr);
        let other = tier.allocate(128).unwrap();
        assert_ne!(other, ptr);
    }

    #[test]
    fn flush_migrates_cache_to_global_stack() {
        let tier = SmallTier::new();
        let ptrs: Vec<_> = (0..8).map(|_| tier.allocate(40).unwrap()).collect();
        for ptr in &ptrs {
            let header = unsafe { ptr.as_ptr().sub(SMALL_HEADER_BYTES).cast::<SmallHeader>() };
            tier.deallocate(header, false);
        }
        tier.flush_current_thread();
        unsafe {
            let index = bucket_index(40);
            let (top, _) = tier.inner.buckets[index].pop().expect("flushed blocks");
            assert_eq!((*top.as_ptr()).in_tls.load(Ordering::Relaxed), 0);
            assert!((*top.as_ptr()).is_free.load(Ordering::Relaxed));
            // Put it back so release accounting stays trivial.
            tier.inner.buckets[index].push(top.as_ptr());
        }
    }

    #[test]
    fn alignment_of_served_pointers() {
        let tier = SmallTier::new();
        for bytes in [1usize, 8, 24, 100, 257, 4096, 1 << 20] {
            let ptr = tier.allocate(bytes).unwrap();
            assert_eq!(ptr.as_ptr() as usize % DEFAULT_ALIGNMENT, 0, "{bytes} bytes");
        }
    }

    #[test]
    fn bypass_tls_goes_to_global() {
        let tier = SmallTier::new();
        let ptr = tier.allocate(64).unwrap();
        let header = unsafe { ptr.as_ptr().sub(SMALL_HEADER_BYTES).cast::<SmallHeader>() };
        tier.deallocate(header, true);
        unsafe {
            let index = bucket_index(64);
            let (top, _) = tier.inner.buckets[index].pop().expect("block on global stack");
            assert_eq!(top.as_ptr(), header);
            tier.inner.buckets[index].push(top.as_ptr());
        }
    }
}
