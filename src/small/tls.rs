//! Per-thread small-block caches.
//!
//! Each thread keeps one singly linked stack per size class plus a
//! deallocation counter. The cache is bound to the pool it last served;
//! rebinding (or thread exit) flushes the cached blocks back to the owning
//! pool through the live-pool registry, or discards them if that pool is
//! already gone.

use core::cell::RefCell;
use core::ptr;
use std::sync::{Mutex, Weak};

use crate::layout::SmallHeader;
use crate::tagged::FreeNode;

use super::size_class::BUCKET_COUNT;
use super::SmallInner;

/// Flush the local stacks back to the global pool after this many frees.
pub(crate) const FLUSH_THRESHOLD: u32 = 256;

pub(crate) struct ThreadCache {
    pool_id: u64,
    heads: [*mut SmallHeader; BUCKET_COUNT],
    pub(crate) deallocation_count: u32,
}

impl ThreadCache {
    fn new() -> Self {
        Self {
            pool_id: 0,
            heads: [ptr::null_mut(); BUCKET_COUNT],
            deallocation_count: 0,
        }
    }

    fn is_empty(&self) -> bool {
        self.heads.iter().all(|head| head.is_null())
    }

    pub(crate) fn pop(&mut self, index: usize) -> Option<*mut SmallHeader> {
        let head = self.heads[index];
        if head.is_null() {
            return None;
        }
        self.heads[index] = unsafe { SmallHeader::link_of(head) };
        Some(head)
    }

    pub(crate) fn push(&mut self, index: usize, header: *mut SmallHeader) {
        unsafe { SmallHeader::set_link(header, self.heads[index]) };
        self.heads[index] = header;
    }

    /// Detaches the stack for `index`, leaving it empty.
    pub(crate) fn detach(&mut self, index: usize) -> *mut SmallHeader {
        core::mem::replace(&mut self.heads[index], ptr::null_mut())
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        if !self.is_empty() {
            flush_to_registered(self);
        }
    }
}

thread_local! {
    static CACHE: RefCell<ThreadCache> = RefCell::new(ThreadCache::new());
}

/// Live pools able to accept flushed blocks, keyed by pool id. Holding the
/// lock while flushing keeps a pool alive for the duration of the flush.
static LIVE_POOLS: Mutex<Vec<(u64, Weak<SmallInner>)>> = Mutex::new(Vec::new());

pub(crate) fn register_pool(id: u64, inner: Weak<SmallInner>) {
    LIVE_POOLS.lock().unwrap().push((id, inner));
}

/// Removes `id` from the registry. Once this returns, no thread cache will
/// flush into the pool anymore.
pub(crate) fn unregister_pool(id: u64) {
    LIVE_POOLS.lock().unwrap().retain(|(entry, _)| *entry != id);
}

fn flush_to_registered(cache: &mut ThreadCache) {
    let pools = LIVE_POOLS.lock().unwrap();
    let target = pools
        .iter()
        .find(|(id, _)| *id == cache.pool_id)
        .and_then(|(_, weak)| weak.upgrade());
    match target {
        Some(inner) => inner.flush_contents(cache),
        None => {
            // The owning pool died; its chunks are gone, so the cached
            // pointers must not be touched.
            log::trace!("discarding thread cache of dead pool {}", cache.pool_id);
            cache.heads = [ptr::null_mut(); BUCKET_COUNT];
            cache.deallocation_count = 0;
        }
    }
}

/// Runs `f` on the calling thread's cache after rebinding it to the pool
/// identified by `id`. Returns `None` when thread-local storage is no
/// longer accessible (thread teardown).
pub(crate) fn with_cache<R>(id: u64, f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    CACHE
        .try_with(|cell| {
            let mut cache = cell.borrow_mut();
            if cache.pool_id != id {
                if !cache.is_empty() {
                    flush_to_registered(&mut cache);
                }
                cache.pool_id = id;
                cache.deallocation_count = 0;
            }
            f(&mut cache)
        })
        .ok()
}
