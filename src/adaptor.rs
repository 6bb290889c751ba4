//! Standard-container adaptor: a [`GlobalAlloc`] over a process-wide pool.
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL: strata::StrataAlloc = strata::StrataAlloc;
//! ```
//!
//! The pool's own bookkeeping (chunk registries, worker spawn) allocates
//! through the global allocator, so the adaptor carries a thread-local
//! reentrancy guard: nested allocations fall through to [`System`]. Those
//! fallback blocks are both created and released inside guarded sections,
//! which keeps the two heaps from crossing; as a belt, deallocation only
//! routes pointers that carry one of this crate's in-band records.

use core::alloc::{GlobalAlloc, Layout};
use core::cell::Cell;
use core::ptr;
use std::alloc::System;
use std::sync::OnceLock;

use crate::pool::Pool;

thread_local! {
    static IN_ALLOCATOR: Cell<bool> = const { Cell::new(false) };
}

struct ReentrancyGuard;

impl ReentrancyGuard {
    fn enter() -> Option<Self> {
        let reentered = IN_ALLOCATOR.try_with(|flag| {
            if flag.get() {
                true
            } else {
                flag.set(true);
                false
            }
        });
        match reentered {
            Ok(false) => Some(Self),
            // Reentered, or TLS is gone (thread teardown): fall back.
            Ok(true) | Err(_) => None,
        }
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_ALLOCATOR.try_with(|flag| flag.set(false));
    }
}

static ADAPTOR_POOL: OnceLock<Pool> = OnceLock::new();

fn adaptor_pool() -> &'static Pool {
    ADAPTOR_POOL.get_or_init(Pool::new_unwarned)
}

/// Drop-in global allocator backed by a process-wide [`Pool`].
pub struct StrataAlloc;

unsafe impl GlobalAlloc for StrataAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let Some(_guard) = ReentrancyGuard::enter() else {
            return System.alloc(layout);
        };
        match adaptor_pool().allocate(layout.size(), layout.align(), false) {
            Ok(pointer) => pointer.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, pointer: *mut u8, layout: Layout) {
        if pointer.is_null() {
            return;
        }
        let Some(_guard) = ReentrancyGuard::enter() else {
            return System.dealloc(pointer, layout);
        };
        if Pool::looks_routable(pointer) {
            adaptor_pool().deallocate(pointer);
        } else {
            System.dealloc(pointer, layout);
        }
    }
}
