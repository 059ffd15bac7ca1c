//! Reservation of the arena close to the code segment
//!
//! Derived from detour-rs: https://github.com/darfink/detour-rs

// detour-rs - A cross-platform detour library written in Rust
// Copyright (C) 2017 Elliott Linder.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.
//
// ===============================================================================
//
// minhook-rs - A minimalist x86/x86-64 hooking library for Rust
// Copyright (C) 2015 Jascha Neutelings.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
//
//  1. Redistributions of source code must retain the above copyright
//     notice, this list of conditions and the following disclaimer.
//  2. Redistributions in binary form must reproduce the above copyright
//     notice, this list of conditions and the following disclaimer in the
//     documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS
// "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED
// TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A
// PARTICULAR PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER
// OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

use std::slice;
use std::sync::{Mutex, PoisonError};

use slice_pool::sync::SlicePool;

use super::search;
use super::{ArenaError, MIN_ADDRESS, MIN_ARENA_SIZE, SEARCH_STRIDE};
use crate::module::CodeSegment;

/// Reserved memory split into code buffers
pub struct Pool {
    /// Allocator over the reservation
    pub memory: SlicePool<u8>,
    /// First address of the reservation
    pub base: usize,
    /// Size of the reservation
    pub len: usize,
}

/// Serializes reservations, a range checked to be free must stay free until it's mapped
static RESERVING: Mutex<()> = Mutex::new(());

/// Size of the arena for a code segment: the text rounded to pages, with a floor
pub fn arena_size(segment: &CodeSegment) -> usize {
    let page = region::page::size();
    let text = segment.text.end - segment.text.start;
    ((text + page - 1) & !(page - 1)).max(MIN_ARENA_SIZE)
}

/// Reserves `size` bytes such that every byte is within `max_distance` of every byte of `segment`'s image.
///
/// Addresses below the image are tried first, then addresses above it.
pub fn reserve(segment: &CodeSegment, size: usize, max_distance: usize) -> Result<Pool, ArenaError> {
    let _reserving = RESERVING.lock().unwrap_or_else(PoisonError::into_inner);
    let page = region::page::size();
    let image = &segment.image;

    let floor = image.end.saturating_sub(max_distance).max(MIN_ADDRESS);
    let below = image.start.saturating_sub(size) & !(page - 1);
    let above = (image.end + page - 1) & !(page - 1);
    let ceiling = image.start.saturating_add(max_distance);

    search::before(below, floor, size, SEARCH_STRIDE)
        .chain(search::after(above, ceiling, size, SEARCH_STRIDE))
        .find_map(|address| match allocate_fixed_pool(address, size) {
            Ok(pool) => Some(pool),
            Err(error) => {
                log::warn!("unable to reserve {size:#x} bytes at {address:#x}: {error}");
                None
            }
        })
        .ok_or(ArenaError::NoReservation { distance: max_distance })
}

/// Tries to allocate fixed memory at the specified address.
///
/// The memory starts out writable, reservations only happen when a mutate window opens.
fn allocate_fixed_pool(address: usize, size: usize) -> Result<Pool, ArenaError> {
    let allocation = region::alloc_at(address as *const u8, size, region::Protection::READ_WRITE_EXECUTE)?;
    let base = allocation.as_ptr::<u8>() as usize;
    if base != address {
        // dropping unmaps it again
        return Err(ArenaError::Moved { requested: address, actual: base });
    }

    log::debug!("reserved arena at {base:#x}..{:#x}", base + size);
    Ok(Pool {
        memory: SlicePool::new(SliceableAllocation(allocation)),
        base,
        len: size,
    })
}

/// A wrapper for making an allocation compatible with `SlicePool`.
struct SliceableAllocation(region::Allocation);

impl SliceableAllocation {
    /// Get a slice of the allocation
    pub fn as_slice(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.0.as_ptr::<u8>(), self.0.len()) }
    }

    /// Get a mutable slice of the allocation
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.0.as_mut_ptr::<u8>(), self.0.len()) }
    }
}

impl AsRef<[u8]> for SliceableAllocation {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for SliceableAllocation {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

unsafe impl Send for SliceableAllocation {}
unsafe impl Sync for SliceableAllocation {}
