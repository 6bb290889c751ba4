//! # `strata` - Multi-Tier Memory Allocator
//!
//! A general-purpose user-space memory allocator that aggregates large OS
//! mappings into finely tunable blocks and recycles freed blocks to
//! amortize syscall cost. Requests are partitioned into four size tiers:
//!
//! 1. **Small** (up to 1 MiB): 64 size classes, per-thread free stacks
//!    over lock-free global stacks with ABA-safe tagged heads and batched
//!    flush.
//! 2. **Medium** (up to 512 MiB): a buddy allocator with per-order
//!    lock-free free lists, an occupancy bitmap for O(1) next-level
//!    search, and an asynchronous merge worker fed by a bounded ring.
//! 3. **Large** (up to 1 GiB): direct OS mappings with an active-block
//!    registry.
//! 4. **Huge** (above 1 GiB): direct OS mappings tracked as
//!    `(base, size)` pairs.
//!
//! ## Routing
//!
//! Default-aligned allocations carry a compact in-band ownership record
//! immediately before the user pointer; deallocation decodes it to find
//! the owning tier. Alignments above the default (16 bytes, capped at
//! 64 KiB) bypass the tiers: the request is over-allocated straight from
//! the OS and a sentinel-tagged header in front of the aligned pointer
//! remembers the mapping.
//!
//! ## Concurrency
//!
//! The hot paths never block: thread-local stacks need no synchronization
//! at all, and the global structures publish `(pointer, tag)` pairs in a
//! single atomic word to defeat ABA. Mutexes only guard cold metadata
//! (chunk registries, active-block registries). Buddy coalescing runs on
//! a detached worker thread that teardown joins.
//!
//! ## Fronts
//!
//! [`Pool`] is the raw engine. [`PoolAllocator`] / [`SystemAllocator`]
//! (dispatched through [`BackingAllocator`]) add the leak-tracking
//! contract, and [`StrataAlloc`] adapts the global handle to
//! `core::alloc::GlobalAlloc` for standard containers.
//!
//! ## Example
//!
//! ```rust
//! use strata::Pool;
//!
//! let pool = Pool::new();
//!
//! // Fast path: default alignment, tier-routed.
//! let small = pool.allocate(64, 0, false).expect("small allocation");
//! unsafe { small.as_ptr().write_bytes(0xAB, 64) };
//! pool.deallocate(small.as_ptr());
//!
//! // Slow path: page alignment, served straight from the OS mapper.
//! let aligned = pool.allocate(1024, 4096, false).expect("aligned allocation");
//! assert_eq!(aligned.as_ptr() as usize % 4096, 0);
//! pool.deallocate(aligned.as_ptr());
//! ```

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::cast_possible_truncation)]

pub mod allocator;
pub mod counters;
mod adaptor;
mod huge;
mod large;
mod layout;
mod medium;
mod os;
mod pool;
mod small;
mod tagged;
mod tracker;

pub use adaptor::StrataAlloc;
pub use allocator::{BackingAllocator, Origin, PoolAllocator, SystemAllocator};
pub use layout::{DEFAULT_ALIGNMENT, MAX_ALIGNMENT};
pub use pool::{AllocError, Pool};
pub use tracker::MemoryTracker;

// Compile-time layout guarantees the in-band records depend on.
const _: () = {
    use core::mem;

    // Ownership and alignment records have fixed, padding-stable layouts.
    assert!(mem::size_of::<layout::OwnerHeader>() == 16);
    assert!(mem::size_of::<layout::AlignHeader>() == 24);

    // Tier headers are 16-aligned and 16-multiple-sized so every user
    // pointer on the fast path lands on the default alignment.
    assert!(mem::size_of::<layout::SmallHeader>() % DEFAULT_ALIGNMENT == 0);
    assert!(mem::size_of::<layout::MediumHeader>() % DEFAULT_ALIGNMENT == 0);
    assert!(mem::size_of::<layout::LargeHeader>() % DEFAULT_ALIGNMENT == 0);
    assert!(mem::size_of::<layout::HugeHeader>() % DEFAULT_ALIGNMENT == 0);
    assert!(mem::align_of::<layout::SmallHeader>() >= DEFAULT_ALIGNMENT);
    assert!(mem::align_of::<layout::MediumHeader>() >= DEFAULT_ALIGNMENT);

    // Any routed pointer has at least an alignment-record's worth of
    // in-band bytes in front of it to probe.
    assert!(
        mem::size_of::<layout::LargeHeader>() + mem::size_of::<layout::OwnerHeader>()
            >= mem::size_of::<layout::AlignHeader>()
    );

    // The size-class table ends exactly at the small-tier boundary.
    assert!(
        small::size_class::BUCKET_SIZES[small::size_class::BUCKET_COUNT - 1]
            == layout::SMALL_MAX_BYTES
    );

    // Ten orders: 1 MiB << 9 is the 512 MiB medium boundary.
    assert!(medium::order_bytes(medium::ORDER_COUNT - 1) == layout::MEDIUM_MAX_BYTES);
};
