//! Source-location leak ledger.
//!
//! An optional, process-global map from user pointers to allocation
//! records. The allocator front ends feed it when leak detection is
//! enabled; reports can be written to any stream. All operations are
//! thread-safe and idempotent with respect to double calls.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock};

/// One live allocation as seen by the tracker.
#[derive(Debug, Clone)]
struct AllocationRecord {
    size: usize,
    file: Option<&'static str>,
    line: u32,
    /// Actual mapping base for aligned or pooled allocations.
    raw: usize,
}

/// Process-global allocation tracker.
pub struct MemoryTracker {
    enabled: AtomicBool,
    detailed: AtomicBool,
    records: Mutex<HashMap<usize, AllocationRecord>>,
}

static TRACKER: OnceLock<MemoryTracker> = OnceLock::new();

impl MemoryTracker {
    /// The singleton instance.
    pub fn global() -> &'static MemoryTracker {
        TRACKER.get_or_init(|| MemoryTracker {
            enabled: AtomicBool::new(false),
            detailed: AtomicBool::new(false),
            records: Mutex::new(HashMap::new()),
        })
    }

    /// Starts tracking; `detailed` additionally reports source locations.
    pub fn enable(&self, detailed: bool) {
        self.detailed.store(detailed, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Release);
    }

    /// Stops tracking. Existing records are kept.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// Whether tracking is currently on.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Records an allocation. No-op when tracking is off or `user_ptr` is
    /// null; re-recording the same pointer overwrites the old record.
    pub fn track_allocation(
        &self,
        user_ptr: *mut u8,
        size: usize,
        origin: Option<(&'static str, u32)>,
        raw_ptr: Option<*mut u8>,
    ) {
        if !self.is_enabled() || user_ptr.is_null() {
            return;
        }
        let (file, line) = match origin {
            Some((file, line)) => (Some(file), line),
            None => (None, 0),
        };
        let record = AllocationRecord {
            size,
            file,
            line,
            raw: raw_ptr.map_or(user_ptr as usize, |raw| raw as usize),
        };
        self.records.lock().unwrap().insert(user_ptr as usize, record);
    }

    /// Forgets an allocation. No-op for unknown pointers, so double frees
    /// cannot distort the ledger.
    pub fn track_deallocation(&self, user_ptr: *mut u8) {
        if !self.is_enabled() || user_ptr.is_null() {
            return;
        }
        self.records.lock().unwrap().remove(&(user_ptr as usize));
    }

    /// Mapping base recorded for `user_ptr`, if any.
    pub fn find_tracked_pointer(&self, user_ptr: *mut u8) -> Option<*mut u8> {
        if user_ptr.is_null() {
            return None;
        }
        self.records
            .lock()
            .unwrap()
            .get(&(user_ptr as usize))
            .map(|record| record.raw as *mut u8)
    }

    /// Writes a leak report for every live record.
    pub fn report_leaks(&self, output: &mut dyn Write) -> io::Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let leaks: Vec<(usize, AllocationRecord)> = {
            let records = self.records.lock().unwrap();
            records
                .iter()
                .map(|(&pointer, record)| (pointer, record.clone()))
                .collect()
        };
        if leaks.is_empty() {
            return writeln!(output, "No memory leaks detected.");
        }
        writeln!(output, "\n=== Memory Leak Report ===")?;
        writeln!(output, "Total leaks: {}\n", leaks.len())?;
        let detailed = self.detailed.load(Ordering::Relaxed);
        for (pointer, record) in leaks {
            write!(output, "Leaked {} bytes at {pointer:#x}", record.size)?;
            if detailed {
                if let Some(file) = record.file {
                    write!(output, " (allocated at {file}:{})", record.line)?;
                }
            }
            writeln!(output)?;
        }
        writeln!(output, "=== End of Report ===")
    }

    /// Sum of all live tracked bytes.
    pub fn current_memory_usage(&self) -> usize {
        self.records
            .lock()
            .unwrap()
            .values()
            .map(|record| record.size)
            .sum()
    }

    #[cfg(test)]
    fn live_records(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}
