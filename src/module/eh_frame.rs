//! Reader for the `.eh_frame_hdr` binary search table
//!
//! The header is followed by a table of `(initial_location, fde_address)` pairs sorted by `initial_location`.
//! Every function with unwind information has exactly one entry, which makes the table a sorted list of
//! function start addresses for the whole image, along with where each function's FDE lives.

use super::ResolveError;

/// `DW_EH_PE_omit`
const DW_EH_PE_OMIT: u8 = 0xff;
/// Only version of the header in use
const EH_FRAME_HDR_VERSION: u8 = 1;
/// `DW_EH_PE_udata4`
const DW_EH_PE_UDATA4: u8 = 0x03;
/// `DW_EH_PE_sdata4`
const DW_EH_PE_SDATA4: u8 = 0x0b;
/// `DW_EH_PE_datarel | DW_EH_PE_sdata4`
const TABLE_ENCODING: u8 = 0x3b;
/// Size of the fixed part of the header: version, three encodings, `eh_frame_ptr` and `fde_count`
pub const HEADER_SIZE: usize = 12;
/// Size of one table entry
pub const ENTRY_SIZE: usize = 8;

/// Parsed header of `.eh_frame_hdr`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Number of entries in the search table
    pub fde_count: usize,
}

impl Header {
    /// Parses the fixed header
    pub fn parse(bytes: &[u8]) -> Result<Self, ResolveError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ResolveError::Truncated);
        }
        let (version, frame_ptr_enc, count_enc, table_enc) = (bytes[0], bytes[1], bytes[2], bytes[3]);
        if version != EH_FRAME_HDR_VERSION {
            return Err(ResolveError::UnsupportedVersion(version));
        }
        // eh_frame_ptr must occupy the 4 bytes before fde_count, whatever it's relative to
        if frame_ptr_enc == DW_EH_PE_OMIT
            || !matches!(frame_ptr_enc & 0x0f, DW_EH_PE_UDATA4 | DW_EH_PE_SDATA4)
        {
            return Err(ResolveError::UnsupportedEncoding(frame_ptr_enc));
        }
        if count_enc != DW_EH_PE_UDATA4 {
            return Err(ResolveError::UnsupportedEncoding(count_enc));
        }
        if table_enc != TABLE_ENCODING {
            return Err(ResolveError::UnsupportedEncoding(table_enc));
        }

        let fde_count = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        Ok(Self { fde_count })
    }

    /// Total size of the header and its table
    pub fn table_end(&self) -> usize {
        HEADER_SIZE + self.fde_count * ENTRY_SIZE
    }
}

/// One row of the search table
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Entry {
    /// Absolute start address of the function
    pub start: usize,
    /// Absolute address of the function's frame description entry
    pub fde: usize,
}

/// Sorted function start addresses of one image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionTable {
    /// Rows ordered by start address
    entries: Vec<Entry>,
}

impl FunctionTable {
    /// Parses the header and table found in `bytes`, which was loaded at address `base`
    pub fn parse(bytes: &[u8], base: usize) -> Result<Self, ResolveError> {
        let header = Header::parse(bytes)?;
        let table = bytes
            .get(HEADER_SIZE..header.table_end())
            .ok_or(ResolveError::Truncated)?;

        let datarel = |offset: [u8; 4]| base.wrapping_add(i32::from_le_bytes(offset) as isize as usize);
        let mut entries: Vec<Entry> = table
            .chunks_exact(ENTRY_SIZE)
            .map(|row| Entry {
                start: datarel([row[0], row[1], row[2], row[3]]),
                fde: datarel([row[4], row[5], row[6], row[7]]),
            })
            .collect();

        // Linkers emit the table sorted, but nothing breaks if one didn't
        if !entries.windows(2).all(|w| w[0].start <= w[1].start) {
            entries.sort_unstable();
        }

        Ok(Self { entries })
    }

    /// Builds a table directly from rows
    pub fn from_entries(mut entries: Vec<Entry>) -> Self {
        entries.sort_unstable();
        Self { entries }
    }

    /// Position of the row for the function starting at `entry`
    fn find(&self, entry: usize) -> Option<usize> {
        self.entries.binary_search_by_key(&entry, |row| row.start).ok()
    }

    /// Returns `true` if a function starts exactly at `entry`
    pub fn contains(&self, entry: usize) -> bool {
        self.find(entry).is_some()
    }

    /// Address of the frame description entry of the function starting at `entry`
    pub fn fde_of(&self, entry: usize) -> Result<usize, ResolveError> {
        self.find(entry)
            .map(|index| self.entries[index].fde)
            .ok_or(ResolveError::NotAFunction(entry))
    }

    /// Returns the length of the function starting at `entry`.
    ///
    /// The function ends at the closest start that is greater than `entry` and lies inside `segment`,
    /// or at the end of `segment` when there is none.
    pub fn length_of(&self, entry: usize, segment: &std::ops::Range<usize>) -> Result<usize, ResolveError> {
        if !self.contains(entry) {
            return Err(ResolveError::NotAFunction(entry));
        }
        if !segment.contains(&entry) {
            return Err(ResolveError::OutsideSegment(entry));
        }

        let next = self.entries.partition_point(|row| row.start <= entry);
        let end = self.entries[next..]
            .iter()
            .map(|row| row.start)
            .find(|start| segment.contains(start))
            .unwrap_or(segment.end);

        Ok(end - entry)
    }

    /// Number of functions in the table
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if the table has no functions
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
