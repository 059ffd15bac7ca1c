//! # Error
//!
//! Top level error returned by redefinition operations

use thiserror::Error;

use crate::alloc::ArenaError;
use crate::code::RelocateError;
use crate::function::ReceiverKind;
use crate::module::ResolveError;
use crate::patcher::PatchError;

/// Errors returned by [`redefine`](crate::redefine), [`redefine_method`](crate::redefine_method) and [`restore`](crate::restore)
#[derive(Debug, Error)]
pub enum Error {
    /// The original and the replacement are the same function
    #[error("cannot redefine a function as itself ({0:#x})")]
    SelfRedefinition(usize),
    /// One receiver is passed by value and the other through a pointer
    #[error("receivers are passed differently: {original:?} != {replacement:?}")]
    ReceiverKindMismatch {
        /// How the original receives its receiver
        original: ReceiverKind,
        /// How the replacement receives its receiver
        replacement: ReceiverKind,
    },
    /// The values the receivers of two methods give access to do not share a layout
    #[error("receiver layouts do not match: {original_size} bytes (align {original_align}) != {replacement_size} bytes (align {replacement_align})")]
    ReceiverMismatch {
        /// Size of the original receiver
        original_size: usize,
        /// Alignment of the original receiver
        original_align: usize,
        /// Size of the replacement receiver
        replacement_size: usize,
        /// Alignment of the replacement receiver
        replacement_align: usize,
    },
    /// The function's code could not be located
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// The function's code could not be relocated or a jump could not be encoded
    #[error(transparent)]
    Relocate(#[from] RelocateError),
    /// The executable arena is unavailable or exhausted
    #[error(transparent)]
    Arena(#[from] ArenaError),
    /// Writing to the live function failed
    #[error(transparent)]
    Patch(#[from] PatchError),
}
