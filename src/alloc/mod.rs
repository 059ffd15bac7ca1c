//! # Alloc
//!
//! Executable memory arena for relocated functions.
//!
//! One region is reserved close to the code segment of the image this crate is linked into, so that relative branches
//! and data references in relocated code can still reach their targets. Buffers are carved out of it with a
//! general-purpose allocator and returned when a function is restored.
//!
//! The arena is sealed (read + execute) unless a mutate window is open. Windows are reference counted and may overlap,
//! the region is sealed again when the last one closes. Relocated code may be running on other threads at any time, so
//! an open window keeps the region executable as well as writable.

use std::ops::{Deref, Range};
use std::sync::{Mutex, MutexGuard, PoisonError};

use lazy_static::lazy_static;
use slice_pool::sync::SliceBox;
use thiserror::Error;

use crate::code::{Architecture, Native};
use crate::module::{self, ResolveError};

use self::proximity::Pool;

pub mod proximity;
pub mod search;

/// Distance between reservation candidates
pub const SEARCH_STRIDE: usize = 0x10_0000;
/// Lowest address a reservation may start at
pub const MIN_ADDRESS: usize = 0x10_0000;
/// Smallest arena that is reserved
pub const MIN_ARENA_SIZE: usize = 0x1_0000;
/// Granularity of buffer sizes
const BUFFER_ALIGNMENT: usize = 16;

/// Errors from the executable memory arena
#[derive(Debug, Error)]
pub enum ArenaError {
    /// The code segment to reserve next to couldn't be found
    #[error("unable to locate the code segment: {0}")]
    Segment(#[from] ResolveError),
    /// No free range within branch distance of the code segment could be reserved
    #[error("no free memory within {distance:#x} bytes of the code segment")]
    NoReservation {
        /// Maximum distance that was searched
        distance: usize,
    },
    /// The system placed a fixed reservation somewhere else
    #[error("requested memory at {requested:#x}, got {actual:#x}")]
    Moved {
        /// Address that was asked for
        requested: usize,
        /// Address that was returned
        actual: usize,
    },
    /// An earlier reservation attempt failed
    #[error("executable memory arena is unavailable")]
    Unavailable,
    /// The arena has no free range large enough
    #[error("executable memory arena has no room for {size} bytes")]
    Exhausted {
        /// Requested size
        size: usize,
    },
    /// Changing the protection of the arena failed
    #[error(transparent)]
    Protection(#[from] region::Error),
}

/// Lazily initialized arena state
#[derive(Default)]
struct State {
    /// Reserved memory, once initialized
    pool: Option<Pool>,
    /// Set when the reservation failed; it's never retried
    failed: bool,
    /// Number of open mutate windows
    writers: usize,
    /// Bytes handed out and not freed yet
    used: usize,
}

/// Memory close to the code segment that relocated functions execute from
pub struct Arena {
    /// Shared state, guarded for the duration of every operation
    state: Mutex<State>,
}

lazy_static! {
    static ref ARENA: Arena = Arena::new();
}

/// Returns the process-wide arena
pub fn arena() -> &'static Arena {
    &ARENA
}

impl Arena {
    /// Creates an arena that reserves its memory on first use
    pub(crate) fn new() -> Self {
        Arena {
            state: Mutex::new(State::default()),
        }
    }

    /// Makes every later mutate window fail, as after a failed reservation
    #[cfg(test)]
    pub(crate) fn disable(&self) {
        self.lock().failed = true;
    }

    /// Locks the state, ignoring poisoning since every update is a single assignment
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserves the memory if that hasn't happened yet, returning its range
    fn initialize(state: &mut State) -> Result<Range<usize>, ArenaError> {
        if state.failed {
            return Err(ArenaError::Unavailable);
        }
        if state.pool.is_none() {
            let reserved = module::current_code_segment()
                .map_err(ArenaError::from)
                .and_then(|segment| {
                    let size = proximity::arena_size(&segment);
                    log::debug!(
                        "reserving {size:#x} bytes near image {:#x}..{:#x}",
                        segment.image.start,
                        segment.image.end
                    );
                    proximity::reserve(&segment, size, Native::MAX_DISTANCE)
                });
            match reserved {
                Ok(pool) => state.pool = Some(pool),
                Err(error) => {
                    log::warn!("executable memory arena is unavailable: {error}");
                    state.failed = true;
                    return Err(error);
                }
            }
        }
        state
            .pool
            .as_ref()
            .map(|pool| pool.base..pool.base + pool.len)
            .ok_or(ArenaError::Unavailable)
    }

    /// Opens a mutate window, reserving the arena on first use.
    ///
    /// Buffers can be allocated, written and freed until the returned guard and every other open guard are dropped.
    pub fn begin_mutate(&self) -> Result<MutateGuard<'_>, ArenaError> {
        let mut state = self.lock();
        let range = Self::initialize(&mut state)?;
        if state.writers == 0 {
            unsafe { region::protect(range.start as *const u8, range.len(), region::Protection::READ_WRITE_EXECUTE)? };
        }
        state.writers += 1;
        Ok(MutateGuard { arena: self })
    }

    /// Closes one mutate window, sealing the arena when it was the last one
    fn end_mutate(&self) {
        let mut state = self.lock();
        state.writers = match state.writers.checked_sub(1) {
            Some(writers) => writers,
            None => panic!("mutate window closed more often than opened"),
        };
        if state.writers > 0 {
            return;
        }
        if let Some(pool) = &state.pool {
            let sealed = unsafe { region::protect(pool.base as *const u8, pool.len, region::Protection::READ_EXECUTE) };
            if let Err(error) = sealed {
                log::warn!("unable to seal the arena: {error}");
            }
        }
    }

    /// Returns `true` while a mutate window is open
    pub fn is_mutable(&self) -> bool {
        self.lock().writers > 0
    }

    /// Number of bytes in buffers that haven't been freed
    pub fn in_use(&self) -> usize {
        self.lock().used
    }

    /// Address range of the reservation, if it has been made
    pub fn range(&self) -> Option<Range<usize>> {
        self.lock().pool.as_ref().map(|pool| pool.base..pool.base + pool.len)
    }

    /// Allocates a buffer of at least `size` bytes.
    ///
    /// # Panics
    ///
    /// Panics if no mutate window is open.
    pub fn allocate(&self, size: usize) -> Result<CodeBuffer, ArenaError> {
        let mut state = self.lock();
        if state.writers == 0 {
            panic!("allocate called while the arena is sealed");
        }
        let pool = state.pool.as_ref().ok_or(ArenaError::Unavailable)?;

        let size = (size.max(1) + BUFFER_ALIGNMENT - 1) & !(BUFFER_ALIGNMENT - 1);
        let buffer = pool.memory.alloc(size).ok_or(ArenaError::Exhausted { size })?;
        state.used += buffer.len();
        log::trace!("allocated {size} bytes at {:#x}", buffer.as_ptr() as usize);
        Ok(CodeBuffer(buffer))
    }

    /// Returns a buffer to the arena.
    ///
    /// # Panics
    ///
    /// Panics if no mutate window is open.
    pub fn free(&self, buffer: CodeBuffer) {
        let mut state = self.lock();
        if state.writers == 0 {
            panic!("free called while the arena is sealed");
        }
        state.used -= buffer.len();
        log::trace!("freed {} bytes at {:#x}", buffer.len(), buffer.address());
        drop(buffer);
    }
}

/// An open mutate window, closed on drop
#[must_use = "the arena is sealed again as soon as the guard is dropped"]
pub struct MutateGuard<'a> {
    /// Arena the window belongs to
    arena: &'a Arena,
}

impl Drop for MutateGuard<'_> {
    fn drop(&mut self) {
        self.arena.end_mutate();
    }
}

/// A buffer inside the arena holding relocated code
pub struct CodeBuffer(SliceBox<u8>);

// The buffer is only written inside mutate windows, which the registry serializes.
unsafe impl Send for CodeBuffer {}
unsafe impl Sync for CodeBuffer {}

impl CodeBuffer {
    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Copies `code` to the start of the buffer.
    ///
    /// # Safety
    ///
    /// A mutate window must be open, and nothing may be executing the buffer.
    pub unsafe fn write(&mut self, code: &[u8]) {
        self.0[..code.len()].copy_from_slice(code);
    }
}

impl Deref for CodeBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.0.deref()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    /// Buffers are aligned, sized in steps and live inside the reservation
    fn test_allocate() {
        let arena = Arena::new();
        let guard = arena.begin_mutate().unwrap();
        let range = arena.range().unwrap();

        let mut buffer = arena.allocate(100).unwrap();
        assert_eq!(buffer.len(), 112);
        assert_eq!(buffer.address() % BUFFER_ALIGNMENT, 0);
        assert!(range.contains(&buffer.address()));

        unsafe { buffer.write(&[0xaa; 100]) };
        assert!(buffer[..100].iter().all(|&b| b == 0xaa));

        arena.free(buffer);
        drop(guard);
    }

    #[test]
    /// The arena is reachable from our own code
    fn test_within_branch_distance() {
        let arena = Arena::new();
        let _guard = arena.begin_mutate().unwrap();
        let range = arena.range().unwrap();
        let here = test_within_branch_distance as usize;

        assert!(range.start.abs_diff(here) < Native::MAX_DISTANCE);
        assert!(range.end.abs_diff(here) < Native::MAX_DISTANCE);
    }

    #[test]
    /// Nested windows keep the arena writable until the outermost one closes
    fn test_nested_windows() {
        let arena = Arena::new();
        assert!(!arena.is_mutable());

        let outer = arena.begin_mutate().unwrap();
        let inner = arena.begin_mutate().unwrap();
        drop(outer);
        assert!(arena.is_mutable());

        let buffer = arena.allocate(16).unwrap();
        arena.free(buffer);

        drop(inner);
        assert!(!arena.is_mutable());
        // the reservation stays
        assert!(arena.range().is_some());
    }

    #[test]
    /// Freed space is handed out again
    fn test_reuse() {
        let arena = Arena::new();
        let _guard = arena.begin_mutate().unwrap();

        let first = arena.allocate(64).unwrap();
        let address = first.address();
        arena.free(first);

        let second = arena.allocate(64).unwrap();
        assert_eq!(second.address(), address);
        arena.free(second);
    }

    #[test]
    /// Usage counts whole buffers and drops back to zero once they're freed
    fn test_in_use() {
        let arena = Arena::new();
        let _guard = arena.begin_mutate().unwrap();
        assert_eq!(arena.in_use(), 0);

        let first = arena.allocate(20).unwrap();
        let second = arena.allocate(64).unwrap();
        assert_eq!(arena.in_use(), 32 + 64);

        arena.free(first);
        assert_eq!(arena.in_use(), 64);
        arena.free(second);
        assert_eq!(arena.in_use(), 0);
    }

    #[test]
    /// Requests larger than the reservation fail without poisoning the arena
    fn test_exhausted() {
        let arena = Arena::new();
        let _guard = arena.begin_mutate().unwrap();
        let len = arena.range().unwrap().len();

        assert!(matches!(arena.allocate(len + 1), Err(ArenaError::Exhausted { .. })));
        let buffer = arena.allocate(16).unwrap();
        arena.free(buffer);
    }

    #[test]
    #[should_panic(expected = "sealed")]
    /// Allocating without a mutate window is a programming error
    fn test_allocate_sealed() {
        let arena = Arena::new();
        drop(arena.begin_mutate().unwrap());
        let _ = arena.allocate(16);
    }

    #[test]
    /// A failed reservation is never retried
    fn test_unavailable_after_failure() {
        let arena = Arena::new();
        arena.lock().failed = true;
        assert!(matches!(arena.begin_mutate(), Err(ArenaError::Unavailable)));
        assert!(!arena.is_mutable());
    }
}
