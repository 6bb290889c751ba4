//! Huge tier: direct OS mappings for requests above 1 GiB.
//!
//! Identical shape to the large tier except the registry stores
//! `(base, size)` pairs, so releasing never has to trust a header of a
//! mapping this big.

use core::ptr::NonNull;
use std::sync::Mutex;

use crate::layout::{HugeHeader, DEFAULT_ALIGNMENT, HUGE_HEADER_BYTES, HUGE_MAGIC};
use crate::os;

pub(crate) struct HugeTier {
    /// `(base, total bytes)` of live mappings.
    active: Mutex<Vec<(usize, usize)>>,
}

impl HugeTier {
    pub(crate) fn new() -> Self {
        Self {
            active: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let total = HUGE_HEADER_BYTES.checked_add(bytes)?;
        let mapping = os::allocate_tracked(total, DEFAULT_ALIGNMENT)?;
        let header = mapping.as_ptr().cast::<HugeHeader>();
        unsafe {
            header.write(HugeHeader {
                magic: HUGE_MAGIC,
                block_size: bytes,
            });
            self.active.lock().unwrap().push((header as usize, total));
            Some(NonNull::new_unchecked(HugeHeader::data(header)))
        }
    }

    pub(crate) fn deallocate(&self, header: *mut HugeHeader) {
        let recorded = {
            let mut active = self.active.lock().unwrap();
            match active.iter().position(|&(base, _)| base == header as usize) {
                Some(index) => Some(active.swap_remove(index)),
                None => None,
            }
        };
        let Some((base, total)) = recorded else {
            // Unknown header: double free or wild pointer; absorb.
            return;
        };
        unsafe {
            if (*header).magic != HUGE_MAGIC {
                log::error!("huge block {header:p} dropped: corrupted header magic");
                return;
            }
            let recorded_in_header = HUGE_HEADER_BYTES + (*header).block_size;
            if recorded_in_header != total {
                log::error!(
                    "huge block {header:p} size mismatch: header says {recorded_in_header} B, registry {total} B"
                );
            }
            (*header).magic = 0;
            os::deallocate_tracked(base as *mut u8, total);
        }
    }

    /// Returns every still-active mapping to the OS. Idempotent.
    pub(crate) fn release_resources(&self) {
        let mut active = self.active.lock().unwrap();
        for &(base, total) in active.iter() {
            unsafe { os::deallocate_tracked(base as *mut u8, total) };
        }
        active.clear();
    }
}

impl Drop for HugeTier {
    fn drop(&mut self) {
        self.release_resources();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests stay well below 1 GiB: the tier's mechanics do not depend on
    // the router-enforced size boundary.

    #[test]
    fn roundtrip_updates_registry() {
        let tier = HugeTier::new();
        let ptr = tier.allocate(1 << 16).unwrap();
        assert_eq!(tier.active.lock().unwrap().len(), 1);
        let header = unsafe { ptr.as_ptr().sub(HUGE_HEADER_BYTES).cast::<HugeHeader>() };
        tier.deallocate(header);
        assert!(tier.active.lock().unwrap().is_empty());
        // Second free of the same header is absorbed by the registry miss.
        tier.deallocate(header);
    }

    #[test]
    fn release_sweeps_leftovers() {
        let tier = HugeTier::new();
        let _leak = tier.allocate(1 << 16).unwrap();
        tier.release_resources();
        assert!(tier.active.lock().unwrap().is_empty());
    }
}
