//! Instruction cache maintenance

/// Makes code written through the data cache visible to instruction fetch.
///
/// Must be called after writing to memory that may already have been executed, and before executing the new bytes.
///
/// # Safety
///
/// `address` must point to at least `len` bytes of mapped memory.
#[inline]
pub unsafe fn flush(address: *const u8, len: usize) {
    #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
    {
        extern "C" {
            fn __clear_cache(begin: *mut libc::c_void, end: *mut libc::c_void);
        }
        __clear_cache(address as *mut libc::c_void, address.add(len) as *mut libc::c_void);
    }

    // instruction fetch is coherent with data writes everywhere else we run
    #[cfg(not(all(target_os = "linux", target_arch = "aarch64")))]
    {
        let _ = (address, len);
    }
}
