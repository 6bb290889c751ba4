//! OS virtual-memory mapper.
//!
//! Thin platform wrappers around anonymous page mappings, plus the tracked
//! entry points the tiers use. Alignments above the page size are forwarded
//! as a huge-page hint; the hint is advisory and mapping falls back to
//! normal pages when the kernel refuses it.

use core::ptr::NonNull;

use crate::counters::COUNTERS;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as platform;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as platform;

/// Smallest mapping granularity the tiers assume.
pub const PAGE_SIZE: usize = 4096;

/// Rounds `value` up to the next multiple of `align` (`align` may be zero).
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    if align == 0 {
        value
    } else {
        (value + (align - 1)) & !(align - 1)
    }
}

/// Maps `bytes` of zeroed read-write memory, updating the process counters.
///
/// `alignment` is the caller's alignment interest for the whole mapping:
/// values above [`PAGE_SIZE`] request huge pages. The returned pointer is
/// always page-aligned. Returns `None` when the OS refuses the mapping.
pub(crate) fn allocate_tracked(bytes: usize, alignment: usize) -> Option<NonNull<u8>> {
    if bytes == 0 {
        return None;
    }
    let size = align_up(bytes, PAGE_SIZE);
    let huge = alignment > PAGE_SIZE;
    let ptr = platform::map_region(size, huge).or_else(|| {
        // No hugetlb pool configured is the common case; retry small-paged.
        if huge {
            platform::map_region(size, false)
        } else {
            None
        }
    })?;
    COUNTERS.on_map(size);
    Some(ptr)
}

/// Returns a mapping obtained from [`allocate_tracked`] to the OS.
///
/// # Safety
/// `ptr` must be the base of a live mapping of `bytes` bytes produced by
/// [`allocate_tracked`], and must not be used afterwards.
pub(crate) unsafe fn deallocate_tracked(ptr: *mut u8, bytes: usize) {
    if ptr.is_null() || bytes == 0 {
        return;
    }
    let size = align_up(bytes, PAGE_SIZE);
    platform::unmap_region(ptr, size);
    COUNTERS.on_unmap(size);
}
