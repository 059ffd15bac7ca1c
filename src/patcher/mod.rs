//! # Patcher
//!
//! Writes into memory that's normally read + execute only, such as the code of a loaded image.
//!
//! The pages covering the write are made writable for the duration of the copy and then returned to the protection
//! they had before. Callers are expected to serialize writes to overlapping pages.

use std::ptr;

use region::Protection;
use thiserror::Error;

use crate::code::cache;

/// Errors when writing to code
#[derive(Debug, Error)]
pub enum PatchError {
    /// Error when setting memory protections
    #[error("error setting memory protections: {0}")]
    Protection(#[from] region::Error),
}

/// Copies `bytes` to `address`, temporarily making the destination writable.
///
/// The instruction cache is flushed for the written range afterwards.
///
/// # Safety
///
/// `address..address + bytes.len()` must be mapped and must not be memory Rust tracks through references. If it holds
/// code, no thread may be executing the overwritten instructions other than at their first byte.
pub unsafe fn write_code(address: usize, bytes: &[u8]) -> Result<(), PatchError> {
    let location = address as *mut u8;
    {
        // the previous protection comes back when the handle drops, even if it didn't allow writing
        let _handle = region::protect_with_handle(location, bytes.len(), Protection::READ_WRITE_EXECUTE)?;
        ptr::copy_nonoverlapping(bytes.as_ptr(), location, bytes.len());
    }
    cache::flush(location, bytes.len());
    log::trace!("wrote {} bytes to {address:#x}", bytes.len());
    Ok(())
}

/// Copies `len` bytes from `address`.
///
/// # Safety
///
/// `address..address + len` must be mapped and readable.
pub unsafe fn read_code(address: usize, len: usize) -> Vec<u8> {
    let mut bytes = vec![0; len];
    ptr::copy_nonoverlapping(address as *const u8, bytes.as_mut_ptr(), len);
    bytes
}
