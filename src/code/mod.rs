//! # Code
//!
//! Decoding and relocation of machine code.
//!
//! Each supported architecture implements [`Architecture`]; the relocation algorithm itself is shared and lives in
//! [`relocate`]. Both architectures are always compiled, [`Native`] picks the one the process is running on.

use thiserror::Error;

pub mod aarch64;
pub mod cache;
pub mod frame;
pub mod x64;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("only x86-64 and AArch64 are supported");

/// Architecture of the running process
#[cfg(target_arch = "x86_64")]
pub type Native = x64::X64;
/// Architecture of the running process
#[cfg(target_arch = "aarch64")]
pub type Native = aarch64::AArch64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
/// Errors while decoding or relocating code
pub enum RelocateError {
    /// An instruction could not be decoded
    #[error("decode error at offset {offset}")]
    Decode {
        /// Offset of the instruction within the function
        offset: usize,
    },
    /// There was nothing to relocate once padding was removed
    #[error("function contains no instructions")]
    Empty,
    /// A corrected displacement doesn't fit its encoding
    #[error("{kind:?} operand at offset {offset} cannot reach {target:#x} from {pc:#x}")]
    OutOfRange {
        /// Kind of the operand that overflowed
        kind: RelativeKind,
        /// Offset of the instruction within the function
        offset: usize,
        /// Address the instruction will execute from
        pc: u64,
        /// Absolute address the operand has to resolve to
        target: u64,
    },
    /// A trampoline could not be generated
    #[error("unable to generate trampoline to {target:#x}")]
    Trampoline {
        /// Absolute call or jump target
        target: u64,
    },
    /// The code is shorter than the jump that should be written over it
    #[error("code is {len} bytes, {required} are needed for a jump")]
    TooShort {
        /// Length of the code
        len: usize,
        /// Length of the jump
        required: usize,
    },
}

/// How a position-relative operand is used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelativeKind {
    /// Relative call
    Call,
    /// Unconditional relative jump
    Jump,
    /// Conditional or short branch
    Branch,
    /// Memory or address operand relative to the program counter
    Data,
    /// Page address relative to the program counter's page
    Page,
}

impl RelativeKind {
    /// Returns `true` for operands that can be redirected through a trampoline
    pub fn is_transfer(&self) -> bool {
        matches!(self, Self::Call | Self::Jump)
    }
}

/// A position-relative operand of a decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relative {
    /// How the operand is used
    pub kind: RelativeKind,
    /// Byte offset of the encoded field within the instruction
    pub operand_offset: usize,
    /// Width of the signed field in bits
    pub width: u32,
    /// Absolute address the operand resolves to when executed from its original location
    pub target: u64,
}

/// One decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Offset from the start of the decoded code
    pub offset: usize,
    /// Length in bytes
    pub len: usize,
    /// Position-relative operand, if any
    pub relative: Option<Relative>,
}

/// Architecture specific encodings needed to move code around
///
/// All functions are pure: they operate on byte buffers and the addresses those buffers are meant to execute from.
pub trait Architecture {
    /// Size of the relative jump written over a redefined function
    const JUMP_SIZE: usize;
    /// Size of a trampoline
    const TRAMPOLINE_SIZE: usize;
    /// Preferred alignment of relocated code
    const ALIGNMENT: usize;
    /// Furthest distance a relative jump can reach
    const MAX_DISTANCE: usize;
    /// Trap instruction used for padding
    const TRAP: &'static [u8];

    /// Decodes every instruction in `code`, which executes from `pc`
    fn decode(code: &[u8], pc: u64) -> Result<Vec<Decoded>, RelocateError>;

    /// Re-encodes the relative operand of `instruction` (which is located in `code`) so that it resolves to the
    /// operand's target when executed from `pc`
    fn retarget(code: &mut [u8], instruction: &Decoded, relative: &Relative, pc: u64) -> Result<(), RelocateError>;

    /// Encodes an unconditional relative jump located at `from` to `to`
    fn jump(from: u64, to: u64) -> Result<Vec<u8>, RelocateError>;

    /// Generates a trampoline located at `pc` that calls `target` and jumps to `resume` once it returns.
    ///
    /// Without `resume` the trampoline jumps to `target` instead of calling it.
    fn trampoline(target: u64, pc: u64, resume: Option<u64>) -> Result<Vec<u8>, RelocateError>;

    /// Short, human readable form of one instruction
    fn format(code: &[u8], instruction: &Decoded, pc: u64) -> String;

    /// Returns `code` without trailing trap padding
    fn trim_padding(code: &[u8]) -> &[u8] {
        let trap = Self::TRAP;
        if code.len() % trap.len() != 0 {
            return code;
        }
        let mut end = code.len();
        while end >= trap.len() && &code[end - trap.len()..end] == trap {
            end -= trap.len();
        }
        &code[..end]
    }

    /// Appends trap instructions until `code` is aligned to [`Architecture::ALIGNMENT`]
    fn pad(code: &mut Vec<u8>) {
        let aligned = (code.len() + Self::ALIGNMENT - 1) & !(Self::ALIGNMENT - 1);
        fill_traps::<Self>(code, aligned);
    }
}

/// Appends trap instructions to `code` until it's `len` bytes long
fn fill_traps<A: Architecture + ?Sized>(code: &mut Vec<u8>, len: usize) {
    while code.len() < len {
        let take = A::TRAP.len().min(len - code.len());
        code.extend_from_slice(&A::TRAP[..take]);
    }
}

/// Returns a buffer size that's large enough for the relocated form of `code`
///
/// Every call or jump leaving the function might need a trampoline, so room for one is reserved per instruction.
pub fn relocated_capacity<A: Architecture>(code: &[u8], src: u64) -> Result<usize, RelocateError> {
    let body = A::trim_padding(code);
    let range = src..src + body.len() as u64;
    let trampolines = A::decode(body, src)?
        .iter()
        .filter_map(|instruction| instruction.relative)
        .filter(|relative| relative.kind.is_transfer() && !range.contains(&relative.target))
        .count();

    let len = body.len() + trampolines * A::TRAMPOLINE_SIZE;
    Ok((len + A::ALIGNMENT - 1) & !(A::ALIGNMENT - 1))
}

/// Relocates `code`, which executes from `src`, so that it can execute from `dst`.
///
/// Every position-relative operand is corrected to resolve to the same absolute address as before. Operands that point
/// into the function itself are left alone since the function moves as a whole (page addresses are the exception, their
/// low bits live in a separate instruction). Calls and jumps whose new displacement
/// doesn't fit are redirected through a trampoline appended after the code; any other overflow is an error.
///
/// Trailing trap padding is removed before decoding and the result is padded back to [`Architecture::ALIGNMENT`].
pub fn relocate<A: Architecture>(code: &[u8], src: u64, dst: u64) -> Result<Vec<u8>, RelocateError> {
    let body = A::trim_padding(code);
    if body.is_empty() {
        return Err(RelocateError::Empty);
    }

    let instructions = A::decode(body, src)?;
    let range = src..src + body.len() as u64;
    let mut relocated = body.to_vec();

    for instruction in &instructions {
        let relative = match instruction.relative {
            Some(relative) => relative,
            None => continue,
        };
        if relative.kind != RelativeKind::Page && range.contains(&relative.target) {
            // both ends move together
            continue;
        }

        let pc = dst + instruction.offset as u64;
        let bytes = &mut relocated[instruction.offset..instruction.offset + instruction.len];
        match A::retarget(bytes, instruction, &relative, pc) {
            Ok(()) => {}
            Err(RelocateError::OutOfRange { .. })
                if relative.kind.is_transfer() && instruction.len >= A::JUMP_SIZE =>
            {
                let at = dst + relocated.len() as u64;
                let resume = (relative.kind == RelativeKind::Call).then(|| pc + instruction.len as u64);
                let trampoline = A::trampoline(relative.target, at, resume)?;

                log::debug!(
                    "{:?} at offset {} reaches {:#x} through a trampoline at {at:#x}",
                    relative.kind,
                    instruction.offset,
                    relative.target
                );

                let jump = A::jump(pc, at)?;
                let bytes = &mut relocated[instruction.offset..instruction.offset + instruction.len];
                bytes[..jump.len()].copy_from_slice(&jump);
                let mut rest = Vec::with_capacity(bytes.len() - jump.len());
                fill_traps::<A>(&mut rest, bytes.len() - jump.len());
                bytes[jump.len()..].copy_from_slice(&rest);

                relocated.extend_from_slice(&trampoline);
            }
            Err(e) => return Err(e),
        }
    }

    A::pad(&mut relocated);
    Ok(relocated)
}

/// Builds the bytes written over a function of `len` bytes at `from` to redirect it to `to`.
///
/// The jump is followed by trap padding up to `len`.
pub fn jump_patch<A: Architecture>(from: u64, to: u64, len: usize) -> Result<Vec<u8>, RelocateError> {
    if len < A::JUMP_SIZE {
        return Err(RelocateError::TooShort {
            len,
            required: A::JUMP_SIZE,
        });
    }

    let mut patch = A::jump(from, to)?;
    fill_traps::<A>(&mut patch, len);
    Ok(patch)
}

/// Produces a listing of `code`, one instruction per line
pub fn disassemble<A: Architecture>(code: &[u8], pc: u64) -> Result<String, RelocateError> {
    let mut listing = String::new();
    for instruction in A::decode(code, pc)? {
        let address = pc + instruction.offset as u64;
        let bytes: String = code[instruction.offset..instruction.offset + instruction.len]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        listing.push_str(&format!(
            "{address:#014x}\t{bytes:<20}\t{}\n",
            A::format(code, &instruction, address)
        ));
    }
    Ok(listing)
}

/// Sign-checks `value` against a field of `width` bits
pub(crate) fn fits_signed(value: i64, width: u32) -> bool {
    let limit = 1i64 << (width - 1);
    (-limit..limit).contains(&value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// Bounds are inclusive of the most negative value and exclusive of the positive limit
    fn test_fits_signed() {
        assert!(fits_signed(i32::MAX as i64, 32));
        assert!(fits_signed(i32::MIN as i64, 32));
        assert!(!fits_signed(i32::MAX as i64 + 1, 32));
        assert!(!fits_signed(i32::MIN as i64 - 1, 32));
        assert!(fits_signed(-128, 8));
        assert!(!fits_signed(128, 8));
    }
}
