use core::ptr::{self, NonNull};

pub(super) fn map_region(size: usize, huge: bool) -> Option<NonNull<u8>> {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANON;
    #[cfg(target_os = "linux")]
    if huge {
        flags |= libc::MAP_HUGETLB;
    }
    #[cfg(not(target_os = "linux"))]
    let _ = huge;

    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            flags,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        None
    } else {
        NonNull::new(ptr.cast::<u8>())
    }
}

pub(super) fn unmap_region(ptr: *mut u8, size: usize) {
    unsafe {
        libc::munmap(ptr.cast::<libc::c_void>(), size);
    }
}
