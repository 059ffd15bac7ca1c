//! # Module
//!
//! Locates the compiled code of functions inside the images loaded by the process.
//!
//! The length of a function is not recorded anywhere at runtime, so it's derived from the image's function table:
//! a function ends where the next one begins, or at the end of its code segment.

use std::collections::HashMap;
use std::ops::Range;
use std::slice;
use std::sync::{PoisonError, RwLock};

use lazy_static::lazy_static;
use thiserror::Error;

pub mod eh_frame;
#[cfg(target_os = "linux")]
mod linux;

/// Errors when looking up a function's code
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No loaded image has an executable segment containing the address
    #[error("address {0:#x} is not inside any loaded code segment")]
    UnknownImage(usize),
    /// The image has no `.eh_frame_hdr`
    #[error("image has no function table")]
    NoFunctionTable,
    /// The address is not the start of a function in the table
    #[error("address {0:#x} is not the start of a function")]
    NotAFunction(usize),
    /// The address is outside of the code segment it was looked up in
    #[error("address {0:#x} is outside of its code segment")]
    OutsideSegment(usize),
    /// The function table uses an unknown version
    #[error("unsupported function table version {0}")]
    UnsupportedVersion(u8),
    /// The function table uses an encoding we can't read
    #[error("unsupported function table encoding {0:#04x}")]
    UnsupportedEncoding(u8),
    /// The function table is shorter than its header claims
    #[error("function table is truncated")]
    Truncated,
    /// The platform has no way to enumerate images
    #[error("function lookup is not supported on this platform")]
    Unsupported,
}

/// Byte range of one compiled function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionRange {
    /// Entry address
    pub entry: usize,
    /// Length in bytes, including trailing padding
    pub len: usize,
}

impl FunctionRange {
    /// Address one past the last byte
    pub fn end(&self) -> usize {
        self.entry + self.len
    }

    /// Returns `true` if `address` belongs to the function
    pub fn contains(&self, address: usize) -> bool {
        (self.entry..self.end()).contains(&address)
    }

    /// Views the function's code.
    ///
    /// # Safety
    ///
    /// The range must describe mapped, readable memory, and nobody may write to it while the slice is alive.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        slice::from_raw_parts(self.entry as *const u8, self.len)
    }
}

/// Address ranges of the image holding some code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSegment {
    /// Executable segment
    pub text: Range<usize>,
    /// Every loadable segment of the image, including data that code refers to
    pub image: Range<usize>,
}

lazy_static! {
    /// Lengths already computed, keyed by entry address
    static ref RANGES: RwLock<HashMap<usize, FunctionRange>> = RwLock::new(HashMap::new());
}

/// Returns the byte range of the function starting at `entry`
pub fn function_range(entry: usize) -> Result<FunctionRange, ResolveError> {
    if let Some(range) = RANGES
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&entry)
    {
        return Ok(*range);
    }

    let range = resolve(entry)?;
    RANGES
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(entry, range);
    Ok(range)
}

/// Computes the range of a function from its image's function table
#[cfg(target_os = "linux")]
fn resolve(entry: usize) -> Result<FunctionRange, ResolveError> {
    let (table, text) = linux::function_table(entry)?;
    let len = table.length_of(entry, &text)?;
    Ok(FunctionRange { entry, len })
}

/// Computes the range of a function from its image's function table
#[cfg(not(target_os = "linux"))]
fn resolve(_entry: usize) -> Result<FunctionRange, ResolveError> {
    Err(ResolveError::Unsupported)
}

/// Returns the address of the frame description entry that describes how to unwind the function at `entry`
#[cfg(target_os = "linux")]
pub fn frame_description(entry: usize) -> Result<usize, ResolveError> {
    let (table, _) = linux::function_table(entry)?;
    table.fde_of(entry)
}

/// Returns the address of the frame description entry that describes how to unwind the function at `entry`
#[cfg(not(target_os = "linux"))]
pub fn frame_description(_entry: usize) -> Result<usize, ResolveError> {
    Err(ResolveError::Unsupported)
}

/// Returns the code segment of the image containing `address`
#[cfg(target_os = "linux")]
pub fn code_segment(address: usize) -> Result<CodeSegment, ResolveError> {
    linux::code_segment(address)
}

/// Returns the code segment of the image containing `address`
#[cfg(not(target_os = "linux"))]
pub fn code_segment(_address: usize) -> Result<CodeSegment, ResolveError> {
    Err(ResolveError::Unsupported)
}

/// Returns the code segment this crate was linked into
pub fn current_code_segment() -> Result<CodeSegment, ResolveError> {
    code_segment(current_code_segment as usize)
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[inline(never)]
    fn measured(v: u64) -> u64 {
        v.rotate_left(7) ^ 0x5a5a
    }

    #[test]
    /// Our own code lives in an executable segment of a loaded image
    fn test_current_code_segment() {
        let segment = current_code_segment().unwrap();
        let here = test_current_code_segment as usize;

        assert!(segment.text.contains(&here));
        assert!(segment.image.start <= segment.text.start);
        assert!(segment.image.end >= segment.text.end);
    }

    #[test]
    /// A compiled function has a non-empty range that starts at its entry
    fn test_function_range() {
        let entry = (measured as fn(u64) -> u64) as usize;
        let range = function_range(entry).unwrap();

        assert_eq!(range.entry, entry);
        assert!(range.len > 0);
        // sanity bound, this function is tiny
        assert!(range.len < 0x1000);
        // cached lookups agree
        assert_eq!(function_range(entry).unwrap(), range);
    }

    #[test]
    /// Every function in the table has a frame description entry pointing back at it
    fn test_frame_description() {
        let entry = (measured as fn(u64) -> u64) as usize;
        let fde = frame_description(entry).unwrap();

        // length, then a non-zero CIE pointer
        let (length, cie) = unsafe { ((fde as *const u32).read_unaligned(), ((fde + 4) as *const u32).read_unaligned()) };
        assert!(length > 0);
        assert_ne!(cie, 0);
    }

    #[test]
    /// Addresses inside a function are not function starts
    fn test_not_a_function() {
        let entry = (measured as fn(u64) -> u64) as usize;
        assert!(matches!(
            function_range(entry + 1),
            Err(ResolveError::NotAFunction(_))
        ));
    }

    #[test]
    /// Heap memory doesn't belong to any image
    fn test_unknown_image() {
        let data = Box::new(0u64);
        let address = &*data as *const u64 as usize;
        assert!(matches!(
            code_segment(address),
            Err(ResolveError::UnknownImage(_))
        ));
    }
}
