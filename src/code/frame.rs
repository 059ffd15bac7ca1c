//! Unwind information for relocated functions
//!
//! A relocated copy isn't covered by the unwind tables of any image, so a panic raised inside it can't unwind and
//! aborts the process. The CIE and FDE describing the original function are copied next to the copy, every
//! position-relative pointer in them is corrected for the new location, and the result is registered with the
//! unwinder.
//!
//! Relocation keeps every instruction at its original offset, which leaves the call frame instructions and the
//! language-specific data area (landing pads are offsets from the function start) valid without changes.

use std::mem;
use std::ptr;
use std::slice;

use thiserror::Error;

use crate::module::{self, ResolveError};

/// `DW_EH_PE_omit`
const DW_EH_PE_OMIT: u8 = 0xff;
/// `DW_EH_PE_absptr`
const DW_EH_PE_ABSPTR: u8 = 0x00;
/// `DW_EH_PE_uleb128`
const DW_EH_PE_ULEB128: u8 = 0x01;
/// `DW_EH_PE_udata2`
const DW_EH_PE_UDATA2: u8 = 0x02;
/// `DW_EH_PE_udata4`
const DW_EH_PE_UDATA4: u8 = 0x03;
/// `DW_EH_PE_udata8`
const DW_EH_PE_UDATA8: u8 = 0x04;
/// `DW_EH_PE_sleb128`
const DW_EH_PE_SLEB128: u8 = 0x09;
/// `DW_EH_PE_sdata2`
const DW_EH_PE_SDATA2: u8 = 0x0a;
/// `DW_EH_PE_sdata4`
const DW_EH_PE_SDATA4: u8 = 0x0b;
/// `DW_EH_PE_sdata8`
const DW_EH_PE_SDATA8: u8 = 0x0c;
/// `DW_EH_PE_pcrel`
const DW_EH_PE_PCREL: u8 = 0x10;
/// Bits selecting how a pointer is applied, without `DW_EH_PE_indirect`
const APPLICATION_MASK: u8 = 0x70;
/// Bits selecting how a pointer is stored
const FORMAT_MASK: u8 = 0x0f;
/// Length value announcing a 64-bit record
const EXTENDED_LENGTH: u32 = 0xffff_ffff;
/// Size of the zero length that ends a list of records
pub const TERMINATOR_SIZE: usize = 4;

/// Errors while copying unwind information
#[derive(Debug, Error)]
pub enum FrameError {
    /// The function's records couldn't be located
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// A record ends before one of its fields
    #[error("unwind record is truncated")]
    Truncated,
    /// The record uses the 64-bit length format
    #[error("64-bit unwind records are not supported")]
    ExtendedLength,
    /// The record at the address is a CIE where an FDE was expected
    #[error("record at {0:#x} is not a frame description entry")]
    NotAnFde(usize),
    /// The record at the address is an FDE where a CIE was expected
    #[error("record at {0:#x} is not a common information entry")]
    NotACie(usize),
    /// The CIE has augmentations we don't know how to skip
    #[error("unsupported augmentation {0:?}")]
    UnsupportedAugmentation(String),
    /// A pointer that has to move uses an encoding we can't rewrite
    #[error("unsupported pointer encoding {0:#04x}")]
    UnsupportedEncoding(u8),
    /// The FDE describes some other function
    #[error("unwind record describes {actual:#x}, expected {expected:#x}")]
    WrongFunction {
        /// Start of the function being copied
        expected: u64,
        /// Start the FDE describes
        actual: u64,
    },
    /// A corrected pointer doesn't fit its encoding
    #[error("pointer to {target:#x} cannot be encoded at {at:#x}")]
    OutOfRange {
        /// Absolute address the pointer resolves to
        target: u64,
        /// Address of the pointer field
        at: u64,
    },
}

/// A CIE or FDE, including its length field
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    /// Address the record is loaded at
    pub address: usize,
    /// Contents, starting with the length
    pub bytes: &'a [u8],
}

impl Record<'static> {
    /// Reads the record at `address`.
    ///
    /// # Safety
    ///
    /// `address` must point at a record in a loaded image's `.eh_frame`, and the image must stay loaded.
    pub unsafe fn read(address: usize) -> Result<Self, FrameError> {
        let length = ptr::read_unaligned(address as *const u32);
        match length {
            0 => Err(FrameError::Truncated),
            EXTENDED_LENGTH => Err(FrameError::ExtendedLength),
            _ => Ok(Self {
                address,
                bytes: slice::from_raw_parts(address as *const u8, length as usize + 4),
            }),
        }
    }
}

impl Record<'_> {
    /// Address of the CIE this FDE refers to
    pub fn cie_address(&self) -> Result<usize, FrameError> {
        let pointer = Reader::at(self.bytes, 4).u32()?;
        if pointer == 0 {
            return Err(FrameError::NotAnFde(self.address));
        }
        Ok((self.address + 4).wrapping_sub(pointer as usize))
    }
}

/// Finds the CIE and FDE of the function starting at `entry`.
///
/// # Safety
///
/// `entry` must belong to an image that stays loaded.
pub unsafe fn records_of(entry: usize) -> Result<(Record<'static>, Record<'static>), FrameError> {
    let fde = Record::read(module::frame_description(entry)?)?;
    let cie = Record::read(fde.cie_address()?)?;
    Ok((cie, fde))
}

/// Number of bytes [`relocate_frame`] produces for `cie` and `fde`
pub fn frame_size(cie: &Record<'_>, fde: &Record<'_>) -> usize {
    cie.bytes.len() + fde.bytes.len() + TERMINATOR_SIZE
}

/// Builds the unwind information of a copy of the function at `src` that executes from `dst`.
///
/// The result is a CIE, an FDE and a terminator, meant to be placed at `at`. Pointers to data outside the function
/// (personality routine, LSDA) keep resolving to the same address, the FDE's start points at `dst`.
pub fn relocate_frame(cie: &Record<'_>, fde: &Record<'_>, src: u64, dst: u64, at: usize) -> Result<Vec<u8>, FrameError> {
    let info = Cie::parse(cie)?;
    let description = Fde::parse(fde, &info)?;

    let described = description.start.resolve(fde.bytes, fde.address)?;
    if described != src {
        return Err(FrameError::WrongFunction {
            expected: src,
            actual: described,
        });
    }

    let fde_at = at + cie.bytes.len();
    let mut frame = Vec::with_capacity(frame_size(cie, fde));
    frame.extend_from_slice(cie.bytes);
    frame.extend_from_slice(fde.bytes);
    frame.extend_from_slice(&[0; TERMINATOR_SIZE]);

    let (new_cie, new_fde) = frame.split_at_mut(cie.bytes.len());
    if let Some(personality) = info.personality {
        personality.retarget(cie.bytes, cie.address, new_cie, at)?;
    }

    // the CIE now sits right before the FDE
    let back = (cie.bytes.len() + 4) as u32;
    new_fde[4..8].copy_from_slice(&back.to_le_bytes());

    description.start.write(new_fde, fde_at, dst)?;
    if let Some(lsda) = description.lsda {
        lsda.retarget(fde.bytes, fde.address, new_fde, fde_at)?;
    }

    Ok(frame)
}

/// Hands records built by [`relocate_frame`] and placed at `address` to the unwinder.
///
/// # Safety
///
/// The records must stay in place until they're passed to [`deregister`].
#[cfg(target_os = "linux")]
pub unsafe fn register(address: usize) {
    extern "C" {
        fn __register_frame(begin: *const u8);
    }
    __register_frame(address as *const u8);
}

/// Hands records built by [`relocate_frame`] and placed at `address` to the unwinder.
///
/// # Safety
///
/// The records must stay in place until they're passed to [`deregister`].
#[cfg(not(target_os = "linux"))]
pub unsafe fn register(_address: usize) {}

/// Removes records added by [`register`].
///
/// # Safety
///
/// `address` must have been registered and not deregistered since.
#[cfg(target_os = "linux")]
pub unsafe fn deregister(address: usize) {
    extern "C" {
        fn __deregister_frame(begin: *const u8);
    }
    __deregister_frame(address as *const u8);
}

/// Removes records added by [`register`].
///
/// # Safety
///
/// `address` must have been registered and not deregistered since.
#[cfg(not(target_os = "linux"))]
pub unsafe fn deregister(_address: usize) {}

/// Encoded pointer field inside a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pointer {
    /// `DW_EH_PE_*` encoding
    encoding: u8,
    /// Offset of the field from the start of the record
    offset: usize,
    /// Size of the field
    size: usize,
}

impl Pointer {
    /// Reads the stored value, sign or zero extended
    fn value(&self, record: &[u8]) -> Result<i64, FrameError> {
        let mut reader = Reader::at(record, self.offset);
        let value = match self.encoding & FORMAT_MASK {
            DW_EH_PE_ABSPTR | DW_EH_PE_UDATA8 | DW_EH_PE_SDATA8 => reader.u64()? as i64,
            DW_EH_PE_UDATA4 => reader.u32()? as i64,
            DW_EH_PE_SDATA4 => reader.u32()? as i32 as i64,
            DW_EH_PE_UDATA2 => reader.u16()? as i64,
            DW_EH_PE_SDATA2 => reader.u16()? as i16 as i64,
            DW_EH_PE_ULEB128 => reader.uleb()? as i64,
            DW_EH_PE_SLEB128 => reader.sleb()?,
            _ => return Err(FrameError::UnsupportedEncoding(self.encoding)),
        };
        Ok(value)
    }

    /// Absolute address the pointer resolves to in `record`, which is loaded at `address`
    fn resolve(&self, record: &[u8], address: usize) -> Result<u64, FrameError> {
        let value = self.value(record)?;
        match self.encoding & APPLICATION_MASK {
            0 => Ok(value as u64),
            DW_EH_PE_PCREL => Ok(((address + self.offset) as u64).wrapping_add(value as u64)),
            _ => Err(FrameError::UnsupportedEncoding(self.encoding)),
        }
    }

    /// Stores `target` in `record`, which will be loaded at `address`
    fn write(&self, record: &mut [u8], address: usize, target: u64) -> Result<(), FrameError> {
        let at = (address + self.offset) as u64;
        let value = match self.encoding & APPLICATION_MASK {
            0 => target as i64,
            DW_EH_PE_PCREL => target.wrapping_sub(at) as i64,
            _ => return Err(FrameError::UnsupportedEncoding(self.encoding)),
        };

        let out_of_range = FrameError::OutOfRange { target, at };
        let bytes: Vec<u8> = match self.encoding & FORMAT_MASK {
            DW_EH_PE_ABSPTR | DW_EH_PE_UDATA8 | DW_EH_PE_SDATA8 => value.to_le_bytes().to_vec(),
            DW_EH_PE_UDATA4 => u32::try_from(value).map_err(|_| out_of_range)?.to_le_bytes().to_vec(),
            DW_EH_PE_SDATA4 => i32::try_from(value).map_err(|_| out_of_range)?.to_le_bytes().to_vec(),
            DW_EH_PE_UDATA2 => u16::try_from(value).map_err(|_| out_of_range)?.to_le_bytes().to_vec(),
            DW_EH_PE_SDATA2 => i16::try_from(value).map_err(|_| out_of_range)?.to_le_bytes().to_vec(),
            // variable length fields can't change value in place
            _ => return Err(FrameError::UnsupportedEncoding(self.encoding)),
        };
        record[self.offset..self.offset + self.size].copy_from_slice(&bytes);
        Ok(())
    }

    /// Rewrites the field in `new`, loaded at `new_address`, to resolve to what it does in `old` at `old_address`
    fn retarget(&self, old: &[u8], old_address: usize, new: &mut [u8], new_address: usize) -> Result<(), FrameError> {
        if self.encoding & APPLICATION_MASK == 0 {
            // absolute, nothing moves
            return Ok(());
        }
        let target = self.resolve(old, old_address)?;
        self.write(new, new_address, target)
    }
}

/// What an FDE needs to know about its CIE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cie {
    /// Personality routine pointer
    personality: Option<Pointer>,
    /// Encoding of the LSDA pointer in FDEs
    lsda_encoding: u8,
    /// Encoding of the start and range of FDEs
    fde_encoding: u8,
    /// FDEs carry augmentation data
    augmented: bool,
}

impl Cie {
    /// Parses the augmentation of a CIE
    fn parse(record: &Record<'_>) -> Result<Self, FrameError> {
        let mut reader = Reader::at(record.bytes, 4);
        if reader.u32()? != 0 {
            return Err(FrameError::NotACie(record.address));
        }
        let version = reader.u8()?;
        let augmentation = reader.string()?;
        if augmentation.starts_with(b"eh") {
            return Err(FrameError::UnsupportedAugmentation(
                String::from_utf8_lossy(augmentation).into_owned(),
            ));
        }

        // code alignment, data alignment, return address register
        reader.uleb()?;
        reader.sleb()?;
        if version == 1 {
            reader.u8()?;
        } else {
            reader.uleb()?;
        }

        let mut cie = Self {
            personality: None,
            lsda_encoding: DW_EH_PE_OMIT,
            fde_encoding: DW_EH_PE_ABSPTR,
            augmented: false,
        };
        let (first, rest) = match augmentation.split_first() {
            Some(split) => split,
            None => return Ok(cie),
        };
        if *first != b'z' {
            return Err(FrameError::UnsupportedAugmentation(
                String::from_utf8_lossy(augmentation).into_owned(),
            ));
        }
        cie.augmented = true;
        reader.uleb()?;

        for &letter in rest {
            match letter {
                b'P' => {
                    let encoding = reader.u8()?;
                    cie.personality = Some(reader.pointer(encoding)?);
                }
                b'L' => cie.lsda_encoding = reader.u8()?,
                b'R' => cie.fde_encoding = reader.u8()?,
                // signal frame, pointer authentication key B, memory tagging
                b'S' | b'B' | b'G' => {}
                _ => {
                    return Err(FrameError::UnsupportedAugmentation(
                        String::from_utf8_lossy(augmentation).into_owned(),
                    ))
                }
            }
        }
        Ok(cie)
    }
}

/// Pointer fields of an FDE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fde {
    /// Start of the described function
    start: Pointer,
    /// Language-specific data area
    lsda: Option<Pointer>,
}

impl Fde {
    /// Parses an FDE belonging to `cie`
    fn parse(record: &Record<'_>, cie: &Cie) -> Result<Self, FrameError> {
        let mut reader = Reader::at(record.bytes, 4);
        if reader.u32()? == 0 {
            return Err(FrameError::NotAnFde(record.address));
        }
        let start = reader.pointer(cie.fde_encoding)?;
        // the range is a plain size in the same format
        reader.pointer(cie.fde_encoding & FORMAT_MASK)?;

        let mut lsda = None;
        if cie.augmented {
            reader.uleb()?;
            if cie.lsda_encoding != DW_EH_PE_OMIT {
                lsda = Some(reader.pointer(cie.lsda_encoding)?);
            }
        }
        Ok(Self { start, lsda })
    }
}

/// Cursor over the fields of a record
struct Reader<'a> {
    /// Whole record
    bytes: &'a [u8],
    /// Offset of the next field
    position: usize,
}

impl<'a> Reader<'a> {
    /// Starts reading at `position`
    fn at(bytes: &'a [u8], position: usize) -> Self {
        Self { bytes, position }
    }

    /// Consumes `len` bytes
    fn take(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        let bytes = self
            .bytes
            .get(self.position..self.position + len)
            .ok_or(FrameError::Truncated)?;
        self.position += len;
        Ok(bytes)
    }

    /// One byte
    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    /// Little endian 16-bit value
    fn u16(&mut self) -> Result<u16, FrameError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    /// Little endian 32-bit value
    fn u32(&mut self) -> Result<u32, FrameError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Little endian 64-bit value
    fn u64(&mut self) -> Result<u64, FrameError> {
        let mut value = [0; 8];
        value.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(value))
    }

    /// Unsigned LEB128
    fn uleb(&mut self) -> Result<u64, FrameError> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            if shift < 64 {
                value |= ((byte & 0x7f) as u64) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
    }

    /// Signed LEB128
    fn sleb(&mut self) -> Result<i64, FrameError> {
        let mut value = 0i64;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            if shift < 64 {
                value |= ((byte & 0x7f) as i64) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    value |= -1i64 << shift;
                }
                return Ok(value);
            }
        }
    }

    /// NUL terminated string, without the terminator
    fn string(&mut self) -> Result<&'a [u8], FrameError> {
        let rest = self.bytes.get(self.position..).ok_or(FrameError::Truncated)?;
        let len = rest.iter().position(|&b| b == 0).ok_or(FrameError::Truncated)?;
        self.position += len + 1;
        Ok(&rest[..len])
    }

    /// Skips over a pointer field, returning where it is
    fn pointer(&mut self, encoding: u8) -> Result<Pointer, FrameError> {
        let offset = self.position;
        match encoding & FORMAT_MASK {
            DW_EH_PE_ABSPTR => {
                self.take(mem::size_of::<usize>())?;
            }
            DW_EH_PE_UDATA8 | DW_EH_PE_SDATA8 => {
                self.take(8)?;
            }
            DW_EH_PE_UDATA4 | DW_EH_PE_SDATA4 => {
                self.take(4)?;
            }
            DW_EH_PE_UDATA2 | DW_EH_PE_SDATA2 => {
                self.take(2)?;
            }
            DW_EH_PE_ULEB128 => {
                self.uleb()?;
            }
            DW_EH_PE_SLEB128 => {
                self.sleb()?;
            }
            _ => return Err(FrameError::UnsupportedEncoding(encoding)),
        }
        Ok(Pointer {
            encoding,
            offset,
            size: self.position - offset,
        })
    }
}
