//! Searches the address space for free ranges close to the code segment
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

use std::ops::Range;

/// Returns free addresses for `size` bytes, starting at `origin` and moving down to `floor`
pub fn before(origin: usize, floor: usize, size: usize, stride: usize) -> impl Iterator<Item = usize> {
    Candidates::new(origin, floor..origin.saturating_add(1), stride, SearchDirection::Before)
        .filter(move |&address| is_free(address, size))
}

/// Returns free addresses for `size` bytes, starting at `origin` and moving up while the range ends before `ceiling`
pub fn after(origin: usize, ceiling: usize, size: usize, stride: usize) -> impl Iterator<Item = usize> {
    let last = ceiling.saturating_sub(size);
    Candidates::new(origin, origin..last.saturating_add(1), stride, SearchDirection::After)
        .filter(move |&address| is_free(address, size))
}

/// Returns `true` if no mapping overlaps `address..address + size`
pub fn is_free(address: usize, size: usize) -> bool {
    match region::query_range(address as *const u8, size) {
        Ok(mut regions) => regions.next().is_none(),
        Err(error) => {
            log::warn!("unable to query {address:#x}: {error}");
            false
        }
    }
}

#[allow(clippy::missing_docs_in_private_items)]
/// Direction for the region search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SearchDirection {
    Before,
    After,
}

/// Candidate addresses spaced `stride` apart, without looking at the address space
#[derive(Debug, Clone)]
struct Candidates {
    /// Addresses that may be returned
    range: Range<usize>,
    /// Distance between candidates
    stride: usize,
    /// Direction we're searching
    search: SearchDirection,
    /// Next address to return
    current: Option<usize>,
}

impl Candidates {
    /// Creates a new iterator starting at `origin`
    fn new(origin: usize, range: Range<usize>, stride: usize, search: SearchDirection) -> Self {
        Candidates {
            range,
            stride,
            search,
            current: Some(origin),
        }
    }
}

impl Iterator for Candidates {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current.filter(|current| self.range.contains(current))?;
        self.current = match self.search {
            SearchDirection::Before => current.checked_sub(self.stride),
            SearchDirection::After => current.checked_add(self.stride),
        };
        Some(current)
    }
}
