//! The pool: routing layer and composition root.
//!
//! A [`Pool`] owns all four tiers. Allocation legalizes the requested
//! alignment, serves default-aligned requests through the tiers with a
//! 16-byte in-band ownership record, and serves larger alignments straight
//! from the OS mapper behind a sentinel-tagged header. Deallocation decodes
//! whichever record precedes the user pointer and routes accordingly.

use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::counters;
use crate::huge::HugeTier;
use crate::large::LargeTier;
use crate::layout::{
    read_align, read_owner, write_align, write_owner, Tier, ALIGN_HEADER_BYTES, ALIGN_SENTINEL,
    DEFAULT_ALIGNMENT, HUGE_HEADER_BYTES, LARGE_HEADER_BYTES, LARGE_MAX_BYTES, MAX_ALIGNMENT,
    MEDIUM_HEADER_BYTES, MEDIUM_MAX_BYTES, OWNER_HEADER_BYTES, SMALL_HEADER_BYTES,
    SMALL_MAX_BYTES,
};
use crate::medium::MediumTier;
use crate::os::{self, align_up};
use crate::small::SmallTier;

/// The error type for allocation failures and invalid deallocations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The OS refused the backing mapping, or the request can never be
    /// satisfied (alignment above the maximum, impossible size).
    AllocFailed,
    /// A pointer without a valid ownership record reached deallocation.
    InvalidPointer,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllocFailed => f.write_str("memory allocation failed"),
            Self::InvalidPointer => f.write_str("pointer does not belong to the pool"),
        }
    }
}

impl std::error::Error for AllocError {}

/// One-shot flag for the direct-use warning; process-wide by design.
static DIRECT_USE_WARNING_SHOWN: AtomicBool = AtomicBool::new(false);

/// Multi-tier memory pool.
///
/// Construction is not thread-safe with respect to the returned value (no
/// allocation may race it); everything else is. Dropping the pool flushes
/// the calling thread's cache, quiesces the merge worker, and returns all
/// OS mappings.
pub struct Pool {
    small: SmallTier,
    medium: MediumTier,
    large: LargeTier,
    huge: HugeTier,
    is_destructing: AtomicBool,
}

impl Pool {
    /// Creates a pool. Warns once per process: direct pool use bypasses
    /// the tracking front ends.
    pub fn new() -> Self {
        if !DIRECT_USE_WARNING_SHOWN.swap(true, Ordering::Relaxed) {
            log::warn!(
                "direct Pool use skips allocation tracking; prefer PoolAllocator in production code"
            );
        }
        Self::new_unwarned()
    }

    pub(crate) fn new_unwarned() -> Self {
        Self {
            small: SmallTier::new(),
            medium: MediumTier::new(),
            large: LargeTier::new(),
            huge: HugeTier::new(),
            is_destructing: AtomicBool::new(false),
        }
    }

    /// Allocates `bytes` with at least `alignment` (0 and 1 mean default).
    ///
    /// With `nothrow` an over-maximum alignment is clamped to the default
    /// instead of failing; every other failure is [`AllocError::AllocFailed`]
    /// either way.
    pub fn allocate(
        &self,
        bytes: usize,
        alignment: usize,
        nothrow: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        let alignment = legalize_alignment(alignment, nothrow)?;
        if alignment <= DEFAULT_ALIGNMENT {
            self.allocate_routed(bytes)
        } else {
            self.allocate_aligned(bytes, alignment)
        }
    }

    /// Returns `pointer` to its owning tier. Null is a no-op; a pointer
    /// without a valid record is dropped (debug builds assert).
    pub fn deallocate(&self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }
        unsafe {
            let candidate = read_align(pointer);
            if candidate.tag == ALIGN_SENTINEL {
                os::deallocate_tracked(candidate.raw, candidate.size);
                return;
            }
            let owner = read_owner(pointer);
            match decoded_tier(pointer, owner.tier, owner.raw) {
                Some(Tier::Small) => self
                    .small
                    .deallocate(owner.raw.cast(), self.is_destructing.load(Ordering::Acquire)),
                Some(Tier::Medium) => self.medium.deallocate(owner.raw.cast()),
                Some(Tier::Large) => self.large.deallocate(owner.raw.cast()),
                Some(Tier::Huge) => self.huge.deallocate(owner.raw.cast()),
                None => {
                    log::error!("pointer {pointer:p} has no ownership record; dropping it");
                    debug_assert!(false, "invalid pointer passed to Pool::deallocate");
                }
            }
        }
    }

    /// Flushes the calling thread's small-block cache to the global stacks.
    pub fn flush_thread_cache(&self) {
        self.small.flush_current_thread();
    }

    /// True when `pointer` carries one of this crate's in-band records.
    /// Used by the global-allocator adaptor to recognize foreign pointers.
    pub(crate) fn looks_routable(pointer: *mut u8) -> bool {
        unsafe {
            let candidate = read_align(pointer);
            if candidate.tag == ALIGN_SENTINEL {
                return true;
            }
            let owner = read_owner(pointer);
            decoded_tier(pointer, owner.tier, owner.raw).is_some()
        }
    }

    fn allocate_routed(&self, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        let total = bytes
            .checked_add(OWNER_HEADER_BYTES)
            .ok_or(AllocError::AllocFailed)?;
        let tier = classify(total);
        let payload = match tier {
            Tier::Small => self.small.allocate(total),
            Tier::Medium => self.medium.allocate(total),
            Tier::Large => self.large.allocate(total),
            Tier::Huge => self.huge.allocate(total),
        }
        .ok_or(AllocError::AllocFailed)?;

        unsafe {
            let raw = payload.as_ptr().sub(header_bytes(tier));
            let user = write_owner(payload.as_ptr(), tier, raw);
            Ok(NonNull::new_unchecked(user))
        }
    }

    fn allocate_aligned(&self, bytes: usize, alignment: usize) -> Result<NonNull<u8>, AllocError> {
        let total = bytes
            .checked_add(alignment - 1)
            .and_then(|sum| sum.checked_add(ALIGN_HEADER_BYTES))
            .ok_or(AllocError::AllocFailed)?;
        let raw = os::allocate_tracked(total, alignment).ok_or(AllocError::AllocFailed)?;
        unsafe {
            let aligned =
                align_up(raw.as_ptr() as usize + ALIGN_HEADER_BYTES, alignment) as *mut u8;
            write_align(aligned, raw.as_ptr(), total);
            Ok(NonNull::new_unchecked(aligned))
        }
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // In-flight frees skip TLS refill from here on.
        self.is_destructing.store(true, Ordering::Release);
        self.small.flush_current_thread();

        // Reverse order of creation.
        self.huge.release_resources();
        self.large.release_resources();
        self.medium.release_resources();
        self.small.release_resources();

        let bytes = counters::used_bytes();
        let ops = counters::op_count();
        if bytes != 0 || ops != 0 {
            log::warn!(
                "pool teardown with nonzero process counters: {bytes} bytes, {ops} net ops \
                 (leaked allocations or other live allocators)"
            );
        }
    }
}

/// Tier serving a total (payload + ownership record) of `total` bytes.
pub(crate) fn classify(total: usize) -> Tier {
    if total <= SMALL_MAX_BYTES {
        Tier::Small
    } else if total <= MEDIUM_MAX_BYTES {
        Tier::Medium
    } else if total <= LARGE_MAX_BYTES {
        Tier::Large
    } else {
        Tier::Huge
    }
}

fn header_bytes(tier: Tier) -> usize {
    match tier {
        Tier::Small => SMALL_HEADER_BYTES,
        Tier::Medium => MEDIUM_HEADER_BYTES,
        Tier::Large => LARGE_HEADER_BYTES,
        Tier::Huge => HUGE_HEADER_BYTES,
    }
}

/// Decodes and cross-checks an ownership record: the recorded tier header
/// address must sit exactly one record plus one tier header below the user
/// pointer, which rejects wild pointers whose bytes happen to look like a
/// tag.
fn decoded_tier(pointer: *mut u8, raw_tag: u32, raw: *mut u8) -> Option<Tier> {
    let tier = Tier::from_raw(raw_tag)?;
    let expected = (pointer as usize)
        .checked_sub(OWNER_HEADER_BYTES + header_bytes(tier))?;
    (raw as usize == expected).then_some(tier)
}

/// Legalizes a requested alignment per the routing rules: 0 and 1 mean
/// default, non-powers-of-two fall back to default, and values above
/// [`MAX_ALIGNMENT`] fail (or clamp to default under `nothrow`).
fn legalize_alignment(alignment: usize, nothrow: bool) -> Result<usize, AllocError> {
    if alignment <= 1 || !alignment.is_power_of_two() {
        return Ok(DEFAULT_ALIGNMENT);
    }
    if alignment > MAX_ALIGNMENT {
        return if nothrow {
            Ok(DEFAULT_ALIGNMENT)
        } else {
            Err(AllocError::AllocFailed)
        };
    }
    Ok(alignment)
}
