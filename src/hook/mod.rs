//! # Hook
//!
//! Redirects a function by writing a jump to another function over its first bytes.
//!
//! The jump is followed by trap padding up to the end of the function, so nothing of the original body remains
//! reachable by falling through.

use crate::code::{self, Native, RelocateError};
use crate::module::FunctionRange;
use crate::patcher::{self, PatchError};

/// A jump from one function to another, ready to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JumpHook {
    /// Function that gets overwritten
    source: FunctionRange,
    /// Address execution continues at
    destination: usize,
    /// Bytes written over the whole function
    patch: Vec<u8>,
}

impl JumpHook {
    /// Encodes a jump from the start of `source` to `destination`.
    ///
    /// Fails if the function is too short for a jump, or if `destination` is out of the jump's reach.
    pub fn new(source: FunctionRange, destination: usize) -> Result<Self, RelocateError> {
        let patch = code::jump_patch::<Native>(source.entry as u64, destination as u64, source.len)?;
        Ok(Self {
            source,
            destination,
            patch,
        })
    }

    /// Function that gets overwritten
    pub fn source(&self) -> FunctionRange {
        self.source
    }

    /// Address execution continues at
    pub fn destination(&self) -> usize {
        self.destination
    }

    /// Bytes written over the function
    pub fn patch(&self) -> &[u8] {
        &self.patch
    }

    /// Writes the jump over the function.
    ///
    /// # Safety
    ///
    /// The source range must be the code of one function and `destination` must be executable code with a compatible
    /// signature.
    pub unsafe fn hook(&self) -> Result<(), PatchError> {
        log::debug!(
            "redirecting {:#x} ({} bytes) to {:#x}",
            self.source.entry,
            self.source.len,
            self.destination
        );
        patcher::write_code(self.source.entry, &self.patch)
    }
}

/// Puts the saved original bytes of a function back.
///
/// # Safety
///
/// `original` must be what was at `source` before any hook was written.
pub unsafe fn unhook(source: FunctionRange, original: &[u8]) -> Result<(), PatchError> {
    debug_assert_eq!(original.len(), source.len);
    log::debug!("restoring {} bytes at {:#x}", original.len(), source.entry);
    patcher::write_code(source.entry, original)
}
