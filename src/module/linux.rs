//! Image discovery through `dl_iterate_phdr`

use core::ffi::c_void;
use std::ops::Range;
use std::slice;

use super::eh_frame::{FunctionTable, Header, HEADER_SIZE};
use super::{CodeSegment, ResolveError};

/// `PT_GNU_EH_FRAME`
const PT_GNU_EH_FRAME: u32 = 0x6474_e550;
/// Executable segment flag
const PF_X: u32 = 1;

/// Program header information about the loaded image containing an address
#[derive(Debug, Clone)]
pub struct Image {
    /// Executable segment containing the address
    pub text: Range<usize>,
    /// Lowest address of any loadable segment
    pub start: usize,
    /// Highest address of any loadable segment
    pub end: usize,
    /// Address of the `.eh_frame_hdr` section, if the image has one
    pub eh_frame_hdr: Option<usize>,
}

/// Finds the loaded image whose executable segment contains `address`
pub fn find_image(address: usize) -> Option<Image> {
    /// State threaded through the iteration callback
    struct Search {
        address: usize,
        found: Option<Image>,
    }

    unsafe extern "C" fn callback(info: *mut libc::dl_phdr_info, _size: libc::size_t, data: *mut c_void) -> libc::c_int {
        let search = &mut *(data as *mut Search);
        let info = &*info;
        if info.dlpi_phdr.is_null() {
            return 0;
        }

        let base = info.dlpi_addr as usize;
        let phdrs = slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize);

        let mut text = None;
        let mut start = usize::MAX;
        let mut end = 0;
        let mut eh_frame_hdr = None;

        for phdr in phdrs {
            let segment_start = base + phdr.p_vaddr as usize;
            let segment = segment_start..segment_start + phdr.p_memsz as usize;
            match phdr.p_type {
                libc::PT_LOAD => {
                    start = start.min(segment.start);
                    end = end.max(segment.end);
                    if phdr.p_flags & PF_X != 0 && segment.contains(&search.address) {
                        text = Some(segment);
                    }
                }
                PT_GNU_EH_FRAME => eh_frame_hdr = Some(segment.start),
                _ => {}
            }
        }

        match text {
            Some(text) => {
                search.found = Some(Image {
                    text,
                    start,
                    end,
                    eh_frame_hdr,
                });
                // stop iterating
                1
            }
            None => 0,
        }
    }

    let mut search = Search { address, found: None };
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut search as *mut Search as *mut c_void);
    }
    search.found
}

/// Returns the code segment of the image containing `address`
pub fn code_segment(address: usize) -> Result<CodeSegment, ResolveError> {
    let image = find_image(address).ok_or(ResolveError::UnknownImage(address))?;
    Ok(CodeSegment {
        text: image.text,
        image: image.start..image.end,
    })
}

/// Reads the function table of the image containing `address`
pub fn function_table(address: usize) -> Result<(FunctionTable, Range<usize>), ResolveError> {
    let image = find_image(address).ok_or(ResolveError::UnknownImage(address))?;
    let hdr = image.eh_frame_hdr.ok_or(ResolveError::NoFunctionTable)?;

    // Safety: PT_GNU_EH_FRAME points into a loaded, readable segment for the lifetime of the image.
    // The header is read first so that we never read beyond the table it describes.
    let table = unsafe {
        let header = Header::parse(slice::from_raw_parts(hdr as *const u8, HEADER_SIZE))?;
        let bytes = slice::from_raw_parts(hdr as *const u8, header.table_end());
        FunctionTable::parse(bytes, hdr)?
    };

    log::debug!(
        "function table at {hdr:#x} lists {} functions for text {:#x}..{:#x}",
        table.len(),
        image.text.start,
        image.text.end
    );

    Ok((table, image.text))
}
