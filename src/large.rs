//! Large tier: direct OS mappings for 512 MiB .. 1 GiB requests.
//!
//! No recycling happens at this size; each allocation is its own mapping,
//! tracked in a mutex-guarded registry so teardown can return stragglers.

use core::ptr::NonNull;
use std::sync::Mutex;

use crate::layout::{LargeHeader, DEFAULT_ALIGNMENT, LARGE_HEADER_BYTES, LARGE_MAGIC};
use crate::os;

pub(crate) struct LargeTier {
    /// Header addresses of live blocks.
    active: Mutex<Vec<usize>>,
}

impl LargeTier {
    pub(crate) fn new() -> Self {
        Self {
            active: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let total = LARGE_HEADER_BYTES.checked_add(bytes)?;
        let mapping = os::allocate_tracked(total, DEFAULT_ALIGNMENT)?;
        let header = mapping.as_ptr().cast::<LargeHeader>();
        unsafe {
            header.write(LargeHeader {
                magic: LARGE_MAGIC,
                block_size: bytes,
            });
            self.active.lock().unwrap().push(header as usize);
            Some(NonNull::new_unchecked(LargeHeader::data(header)))
        }
    }

    pub(crate) fn deallocate(&self, header: *mut LargeHeader) {
        // Membership first: an unknown header is a double free or a wild
        // pointer, and its memory must not be touched.
        {
            let mut active = self.active.lock().unwrap();
            match active.iter().position(|&entry| entry == header as usize) {
                Some(index) => {
                    active.swap_remove(index);
                }
                None => return,
            }
        }
        unsafe {
            if (*header).magic != LARGE_MAGIC {
                log::error!("large block {header:p} dropped: corrupted header magic");
                return;
            }
            (*header).magic = 0;
            let bytes = LARGE_HEADER_BYTES + (*header).block_size;
            os::deallocate_tracked(header.cast(), bytes);
        }
    }

    /// Returns every still-active mapping to the OS. Idempotent.
    pub(crate) fn release_resources(&self) {
        let mut active = self.active.lock().unwrap();
        for &entry in active.iter() {
            let header = entry as *mut LargeHeader;
            unsafe {
                let bytes = LARGE_HEADER_BYTES + (*header).block_size;
                os::deallocate_tracked(header.cast(), bytes);
            }
        }
        active.clear();
    }
}

impl Drop for LargeTier {
    fn drop(&mut self) {
        self.release_resources();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_registers_and_deallocate_unregisters() {
        let tier = LargeTier::new();
        let ptr = tier.allocate(4096).unwrap();
        assert_eq!(tier.active.lock().unwrap().len(), 1);
        unsafe {
            ptr.as_ptr().write_bytes(0x5A, 4096);
        }
        let header = unsafe { ptr.as_ptr().sub(LARGE_HEADER_BYTES).cast::<LargeHeader>() };
        tier.deallocate(header);
        assert!(tier.active.lock().unwrap().is_empty());
    }

    #[test]
    fn release_sweeps_leftovers() {
        let tier = LargeTier::new();
        let _leak = tier.allocate(4096).unwrap();
        let _leak_too = tier.allocate(8192).unwrap();
        assert_eq!(tier.active.lock().unwrap().len(), 2);
        tier.release_resources();
        assert!(tier.active.lock().unwrap().is_empty());
    }
}
