//! Process-wide allocation counters.
//!
//! Every mapping obtained from (or returned to) the operating system passes
//! through these two counters. At any quiescent point `used_bytes` is the
//! net outstanding OS-managed byte count and `op_count` the net outstanding
//! operation count (+1 per mapping, -1 per unmapping). Pool teardown reads
//! both to detect leaks and alloc/free imbalance.

use core::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub(crate) struct OsCounters {
    used_bytes: AtomicU64,
    op_count: AtomicI64,
}

pub(crate) static COUNTERS: OsCounters = OsCounters {
    used_bytes: AtomicU64::new(0),
    op_count: AtomicI64::new(0),
};

impl OsCounters {
    #[inline]
    pub(crate) fn on_map(&self, bytes: usize) {
        self.used_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.op_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn on_unmap(&self, bytes: usize) {
        self.used_bytes.fetch_sub(bytes as u64, Ordering::Relaxed);
        self.op_count.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Net bytes currently mapped from the operating system.
pub fn used_bytes() -> u64 {
    COUNTERS.used_bytes.load(Ordering::SeqCst)
}

/// Net mapping operations: +1 per OS allocation, -1 per OS release.
pub fn op_count() -> i64 {
    COUNTERS.op_count.load(Ordering::SeqCst)
}
