//! Allocator front ends and the process-global allocator handle.
//!
//! Two front ends share one external contract: [`SystemAllocator`] maps
//! every request straight from the OS, [`PoolAllocator`] routes through a
//! [`Pool`]. Both feed the [`MemoryTracker`] when leak detection is on.
//! [`BackingAllocator`] is the tagged dispatch over the two — allocator
//! swaps are rare, so an enum match replaces any virtual interface.

use core::ptr::{self, NonNull};
use std::collections::{BTreeSet, HashMap};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::counters;
use crate::layout::DEFAULT_ALIGNMENT;
use crate::os;
use crate::pool::{AllocError, Pool};
use crate::tracker::MemoryTracker;

/// Source location forwarded to the tracker: `(file, line)`.
pub type Origin = Option<(&'static str, u32)>;

/// Front end that maps every allocation directly from the OS.
pub struct SystemAllocator {
    leak_detection: AtomicBool,
    /// Pointer to mapping size; sizes the release when tracking is off.
    ledger: Mutex<HashMap<usize, usize>>,
}

impl SystemAllocator {
    /// Creates an empty system front end.
    pub fn new() -> Self {
        Self {
            leak_detection: AtomicBool::new(false),
            ledger: Mutex::new(HashMap::new()),
        }
    }

    /// Maps `bytes` from the OS. Zero-size requests fail.
    pub fn allocate(
        &self,
        bytes: usize,
        alignment: usize,
        origin: Origin,
        nothrow: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        if bytes == 0 {
            return Err(AllocError::AllocFailed);
        }
        let alignment = if alignment == 0 {
            DEFAULT_ALIGNMENT
        } else {
            alignment
        };
        let Some(pointer) = os::allocate_tracked(bytes, alignment) else {
            if nothrow {
                if let Some((file, line)) = origin {
                    log::warn!("OS allocation of {bytes} bytes failed at {file}:{line}");
                } else {
                    log::warn!("OS allocation of {bytes} bytes failed");
                }
            }
            return Err(AllocError::AllocFailed);
        };
        self.ledger
            .lock()
            .unwrap()
            .insert(pointer.as_ptr() as usize, bytes);
        if self.leak_detection.load(Ordering::Acquire) {
            MemoryTracker::global().track_allocation(pointer.as_ptr(), bytes, origin, None);
        }
        Ok(pointer)
    }

    /// Releases a mapping produced by [`Self::allocate`]. Unknown pointers
    /// are absorbed.
    pub fn deallocate(&self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }
        if self.leak_detection.load(Ordering::Acquire) {
            MemoryTracker::global().track_deallocation(pointer);
        }
        let Some(bytes) = self.ledger.lock().unwrap().remove(&(pointer as usize)) else {
            return;
        };
        unsafe { os::deallocate_tracked(pointer, bytes) };
    }

    /// Turns on the leak ledger for subsequent allocations.
    pub fn enable_leak_detection(&self, detailed: bool) {
        self.leak_detection.store(true, Ordering::Release);
        MemoryTracker::global().enable(detailed);
    }

    /// Writes the tracker's leak report to `output`.
    pub fn report_leaks(&self, output: &mut dyn Write) -> io::Result<()> {
        MemoryTracker::global().report_leaks(output)
    }

    /// Bytes currently live according to the tracker.
    pub fn current_memory_usage(&self) -> usize {
        MemoryTracker::global().current_memory_usage()
    }
}

impl Default for SystemAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SystemAllocator {
    fn drop(&mut self) {
        let leaked = counters::used_bytes();
        let imbalance = counters::op_count();
        if leaked != 0 {
            log::warn!("system allocator dropped with {leaked} bytes still mapped process-wide");
        }
        if imbalance != 0 {
            log::warn!("system allocator dropped with {imbalance} net operations process-wide");
        }
    }
}

/// Front end that routes through a multi-tier [`Pool`].
pub struct PoolAllocator {
    pool: Pool,
    leak_detection: AtomicBool,
    /// Address-ordered live pointers, kept while tracking is off so the
    /// drop can report unfreed allocations.
    pending: Mutex<BTreeSet<usize>>,
}

impl PoolAllocator {
    /// Creates a front end over a fresh pool.
    pub fn new() -> Self {
        Self {
            pool: Pool::new_unwarned(),
            leak_detection: AtomicBool::new(false),
            pending: Mutex::new(BTreeSet::new()),
        }
    }

    /// Allocates through the pool. Zero-size requests fail.
    pub fn allocate(
        &self,
        bytes: usize,
        alignment: usize,
        origin: Origin,
        nothrow: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        if bytes == 0 {
            return Err(AllocError::AllocFailed);
        }
        let pointer = self.pool.allocate(bytes, alignment, nothrow)?;
        if self.leak_detection.load(Ordering::Acquire) {
            MemoryTracker::global().track_allocation(pointer.as_ptr(), bytes, origin, None);
        } else {
            self.pending.lock().unwrap().insert(pointer.as_ptr() as usize);
        }
        Ok(pointer)
    }

    /// Returns `pointer` to the pool.
    pub fn deallocate(&self, pointer: *mut u8) {
        if pointer.is_null() {
            return;
        }
        if self.leak_detection.load(Ordering::Acquire) {
            MemoryTracker::global().track_deallocation(pointer);
        } else if !self.pending.lock().unwrap().remove(&(pointer as usize)) {
            log::warn!("deallocating untracked pointer {pointer:p}");
        }
        self.pool.deallocate(pointer);
    }

    /// Flushes the calling thread's small-block cache.
    pub fn flush_thread_cache(&self) {
        self.pool.flush_thread_cache();
    }

    /// Turns on the leak ledger for subsequent allocations.
    pub fn enable_leak_detection(&self, detailed: bool) {
        self.leak_detection.store(true, Ordering::Release);
        MemoryTracker::global().enable(detailed);
    }

    /// Writes the tracker's leak report to `output`.
    pub fn report_leaks(&self, output: &mut dyn Write) -> io::Result<()> {
        MemoryTracker::global().report_leaks(output)
    }

    /// Bytes currently live according to the tracker.
    pub fn current_memory_usage(&self) -> usize {
        MemoryTracker::global().current_memory_usage()
    }
}

impl Default for PoolAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        if !self.leak_detection.load(Ordering::Acquire) {
            let unfreed = self.pending.lock().unwrap().len();
            if unfreed != 0 {
                log::warn!("{unfreed} allocations were never freed through this allocator");
            }
        }
    }
}

/// Tagged dispatch over the two allocator front ends.
pub enum BackingAllocator {
    /// Direct OS mappings.
    System(SystemAllocator),
    /// Multi-tier pool.
    Pool(PoolAllocator),
}

impl BackingAllocator {
    /// Allocates via whichever front end this is.
    pub fn allocate(
        &self,
        bytes: usize,
        alignment: usize,
        origin: Origin,
        nothrow: bool,
    ) -> Result<NonNull<u8>, AllocError> {
        match self {
            Self::System(system) => system.allocate(bytes, alignment, origin, nothrow),
            Self::Pool(pool) => pool.allocate(bytes, alignment, origin, nothrow),
        }
    }

    /// Deallocates via whichever front end this is.
    pub fn deallocate(&self, pointer: *mut u8) {
        match self {
            Self::System(system) => system.deallocate(pointer),
            Self::Pool(pool) => pool.deallocate(pointer),
        }
    }

    /// Turns on the leak ledger.
    pub fn enable_leak_detection(&self, detailed: bool) {
        match self {
            Self::System(system) => system.enable_leak_detection(detailed),
            Self::Pool(pool) => pool.enable_leak_detection(detailed),
        }
    }

    /// Writes the leak report to `output`.
    pub fn report_leaks(&self, output: &mut dyn Write) -> io::Result<()> {
        match self {
            Self::System(system) => system.report_leaks(output),
            Self::Pool(pool) => pool.report_leaks(output),
        }
    }

    /// Bytes currently live according to the tracker.
    pub fn current_memory_usage(&self) -> usize {
        match self {
            Self::System(system) => system.current_memory_usage(),
            Self::Pool(pool) => pool.current_memory_usage(),
        }
    }

    /// The pool front end, when this is the pool variant.
    pub fn as_pool(&self) -> Option<&PoolAllocator> {
        match self {
            Self::Pool(pool) => Some(pool),
            Self::System(_) => None,
        }
    }
}

static CUSTOM_GLOBAL: AtomicPtr<BackingAllocator> = AtomicPtr::new(ptr::null_mut());
static DEFAULT_GLOBAL: OnceLock<BackingAllocator> = OnceLock::new();

/// The process-global allocator: a custom one if installed, otherwise a
/// lazily created pool-backed default.
pub fn global() -> &'static BackingAllocator {
    let custom = CUSTOM_GLOBAL.load(Ordering::Acquire);
    if !custom.is_null() {
        unsafe { &*custom }
    } else {
        DEFAULT_GLOBAL.get_or_init(|| BackingAllocator::Pool(PoolAllocator::new()))
    }
}

/// Installs `allocator` as the process-global allocator. Allocations made
/// through the previous one must still be freed through it.
pub fn set_global(allocator: &'static BackingAllocator) {
    CUSTOM_GLOBAL.store(
        allocator as *const BackingAllocator as *mut BackingAllocator,
        Ordering::Release,
    );
}

/// Allocates through the process-global allocator.
pub fn allocate(
    bytes: usize,
    alignment: usize,
    origin: Origin,
    nothrow: bool,
) -> Result<NonNull<u8>, AllocError> {
    global().allocate(bytes, alignment, origin, nothrow)
}

/// Like [`allocate`] with `nothrow` semantics: null on failure.
pub fn allocate_nothrow(bytes: usize, alignment: usize) -> *mut u8 {
    global()
        .allocate(bytes, alignment, None, true)
        .map_or(ptr::null_mut(), NonNull::as_ptr)
}

/// Deallocates through the process-global allocator.
pub fn deallocate(pointer: *mut u8) {
    global().deallocate(pointer);
}

/// Enables the leak ledger on the process-global allocator.
pub fn enable_leak_detection(detailed: bool) {
    global().enable_leak_detection(detailed);
}

/// Writes the process-global leak report to `output`.
pub fn report_leaks(output: &mut dyn Write) -> io::Result<()> {
    global().report_leaks(output)
}

/// Bytes currently live according to the tracker.
pub fn current_memory_usage() -> usize {
    global().current_memory_usage()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_roundtrip() {
        let system = SystemAllocator::new();
        let ptr = system.allocate(4096, 0, None, false).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0x11, 4096) };
        system.deallocate(ptr.as_ptr());
        // Unknown pointer is absorbed.
        system.deallocate(ptr.as_ptr());
    }

    #[test]
    fn system_zero_bytes_fails() {
        let system = SystemAllocator::new();
        assert_eq!(
            system.allocate(0, 0, None, true).unwrap_err(),
            AllocError::AllocFailed
        );
    }

    #[test]
    fn pool_front_roundtrip() {
        let allocator = PoolAllocator::new();
        let a = allocator.allocate(100, 0, None, false).unwrap();
        let b = allocator.allocate(5000, 0, None, false).unwrap();
        assert_ne!(a, b);
        allocator.deallocate(a.as_ptr());
        allocator.deallocate(b.as_ptr());
    }

    #[test]
    fn backing_dispatch() {
        let backing = BackingAllocator::Pool(PoolAllocator::new());
        let ptr = backing.allocate(64, 0, None, false).unwrap();
        backing.deallocate(ptr.as_ptr());
        assert!(backing.as_pool().is_some());

        let system = BackingAllocator::System(SystemAllocator::new());
        assert!(system.as_pool().is_none());
    }

    #[test]
    fn global_handle_serves() {
        let ptr = allocate_nothrow(256, 0);
        assert!(!ptr.is_null());
        deallocate(ptr);
    }
}
