use core::ffi::c_void;
use core::ptr::{self, NonNull};

use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_LARGE_PAGES, MEM_RELEASE, MEM_RESERVE,
    PAGE_READWRITE,
};

pub(super) fn map_region(size: usize, huge: bool) -> Option<NonNull<u8>> {
    let mut allocation_type = MEM_COMMIT | MEM_RESERVE;
    if huge {
        allocation_type |= MEM_LARGE_PAGES;
    }
    let ptr = unsafe { VirtualAlloc(ptr::null(), size, allocation_type, PAGE_READWRITE) };
    NonNull::new(ptr.cast::<u8>())
}

pub(super) fn unmap_region(ptr: *mut u8, _size: usize) {
    unsafe {
        VirtualFree(ptr.cast::<c_void>(), 0, MEM_RELEASE);
    }
}
