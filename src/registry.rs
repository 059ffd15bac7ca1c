//! # Registry
//!
//! Process-wide record of redefined functions.
//!
//! The first redefinition of a function copies its code into the executable arena, relocated so that it still
//! behaves like the original, and saves the bytes that are about to be overwritten. Later redefinitions of the same
//! function only rewrite the jump. Restoring puts the saved bytes back and frees the copy.
//!
//! Redefining and restoring hold the write lock for the whole operation, which also serializes every permission change
//! on the arena and on code pages. Looking up the original only takes the read lock.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use lazy_static::lazy_static;

use crate::alloc::{self, Arena, ArenaError, CodeBuffer};
use crate::code::{self, cache, frame, Architecture, Native};
use crate::error::Error;
use crate::function::{Function, Method, Receiver};
use crate::hook::{self, JumpHook};
use crate::module::{self, FunctionRange};

/// A redefined function
struct ClonedFunction {
    /// Location of the live function
    range: FunctionRange,
    /// Code of the live function before it was first redefined
    original: Vec<u8>,
    /// Relocated copy of `original`, followed by its unwind information
    code: CodeBuffer,
    /// Address of the registered unwind information inside `code`
    frame: Option<usize>,
}

lazy_static! {
    /// Redefined functions keyed by entry address
    static ref REGISTRY: RwLock<HashMap<usize, ClonedFunction>> = RwLock::new(HashMap::new());
}

/// Locks the registry for reading
fn read() -> RwLockReadGuard<'static, HashMap<usize, ClonedFunction>> {
    REGISTRY.read().unwrap_or_else(PoisonError::into_inner)
}

/// Locks the registry for writing
fn write() -> RwLockWriteGuard<'static, HashMap<usize, ClonedFunction>> {
    REGISTRY.write().unwrap_or_else(PoisonError::into_inner)
}

/// Redirects every call of `original` to `replacement`.
///
/// The behavior `original` had before stays available through [`original`](crate::original). Redefining a function
/// that is already redefined only changes where it jumps to.
///
/// Calls that were inlined, and calls that are already past the first instructions of `original` while the jump is
/// written, are not redirected.
///
/// # Safety
///
/// Both functions must be safe to call with any arguments the other accepts. No other code may be writing to the
/// code of `original` at the same time.
pub unsafe fn redefine<F: Function>(original: F, replacement: F) -> Result<(), Error> {
    redefine_address(original.address(), replacement.address())
}

/// Redirects every call of the method `original` to `replacement`.
///
/// The receivers may be different types as long as they're passed the same way and the values they give access to
/// have the same size and alignment. For references and pointers that's the type pointed to. Everything else about
/// the signatures must be identical.
///
/// # Safety
///
/// Same as [`redefine`]. In addition `replacement` must accept the bits of any `F::Receiver` as its own receiver.
pub unsafe fn redefine_method<F, G>(original: F, replacement: G) -> Result<(), Error>
where
    F: Method,
    G: Method<Rest = F::Rest, Output = F::Output>,
{
    let (expected_kind, actual_kind) = (<F::Receiver as Receiver>::KIND, <G::Receiver as Receiver>::KIND);
    if expected_kind != actual_kind {
        return Err(Error::ReceiverKindMismatch {
            original: expected_kind,
            replacement: actual_kind,
        });
    }

    let expected = <F::Receiver as Receiver>::target_layout();
    let actual = <G::Receiver as Receiver>::target_layout();
    if expected != actual {
        return Err(Error::ReceiverMismatch {
            original_size: expected.size(),
            original_align: expected.align(),
            replacement_size: actual.size(),
            replacement_align: actual.align(),
        });
    }
    redefine_address(original.address(), replacement.address())
}

/// Returns a function that behaves like `f` did before it was redefined.
///
/// When `f` isn't redefined, it's returned unchanged. Panics raised by the copy unwind normally as long as the
/// function's unwind information could be copied. Otherwise they abort the process, and a warning is logged when the
/// copy is made. Panics in functions the copy calls through a trampoline abort as well.
pub fn original<F: Function>(f: F) -> F {
    match read().get(&f.address()) {
        // Safety: the copy is a relocated version of the code of `f`, so it shares its signature
        Some(cloned) => unsafe { F::from_ptr(cloned.code.address() as *const ()) },
        None => f,
    }
}

/// Returns `true` if `f` is currently redefined
pub fn is_redefined<F: Function>(f: F) -> bool {
    read().contains_key(&f.address())
}

/// Undoes the redefinition of `f`.
///
/// Restoring a function that isn't redefined does nothing.
///
/// # Safety
///
/// Functions previously returned by [`original`](crate::original) for `f` are freed and must not be called anymore,
/// nor be running on any thread.
pub unsafe fn restore<F: Function>(f: F) -> Result<(), Error> {
    let address = f.address();
    let mut registry = write();

    let cloned = match registry.get(&address) {
        Some(cloned) => cloned,
        None => {
            log::debug!("{address:#x} is not redefined, nothing to restore");
            return Ok(());
        }
    };
    hook::unhook(cloned.range, &cloned.original)?;

    // the function is restored at this point, a copy that can't be freed only costs arena space
    if let Some(cloned) = registry.remove(&address) {
        discard(alloc::arena(), address, cloned);
    }
    log::debug!("restored {address:#x}");
    Ok(())
}

/// Redirects the function at `address` to `replacement`, cloning it first if needed
unsafe fn redefine_address(address: usize, replacement: usize) -> Result<(), Error> {
    if address == replacement {
        return Err(Error::SelfRedefinition(address));
    }
    let range = module::function_range(address)?;

    // nothing is touched unless the jump can be encoded
    let hook = JumpHook::new(range, replacement)?;

    let mut registry = write();
    let created = !registry.contains_key(&address);
    if created {
        let code = range.as_slice().to_vec();
        registry.insert(address, clone_function(alloc::arena(), range, code)?);
    }

    if let Err(error) = hook.hook() {
        if created {
            if let Some(cloned) = registry.remove(&address) {
                discard(alloc::arena(), address, cloned);
            }
        }
        return Err(error.into());
    }

    log::debug!("redefined {address:#x} as {replacement:#x}");
    Ok(())
}

/// Copies `original`, the code of the function at `range`, into `arena`.
///
/// The function's unwind information is copied along and registered, so that panics raised in the copy unwind like
/// they do in the original. A function whose unwind information can't be copied is still cloned.
fn clone_function(arena: &Arena, range: FunctionRange, original: Vec<u8>) -> Result<ClonedFunction, Error> {
    let src = range.entry as u64;
    let capacity = code::relocated_capacity::<Native>(&original, src)?;

    // Safety: the records live in the image the function was found in
    let records = match unsafe { frame::records_of(range.entry) } {
        Ok(records) => Some(records),
        Err(error) => {
            log::warn!("no unwind information for the copy of {:#x}: {error}", range.entry);
            None
        }
    };
    let frame_size = records.as_ref().map_or(0, |(cie, fde)| frame::frame_size(cie, fde));

    let _window = arena.begin_mutate()?;
    let mut buffer = arena.allocate(capacity + frame_size)?;
    let dst = buffer.address() as u64;

    let mut relocated = match code::relocate::<Native>(&original, src, dst) {
        Ok(relocated) if relocated.len() <= capacity => relocated,
        Ok(relocated) => {
            arena.free(buffer);
            return Err(ArenaError::Exhausted { size: relocated.len() }.into());
        }
        Err(error) => {
            arena.free(buffer);
            return Err(error.into());
        }
    };
    fill(&mut relocated, capacity);

    let unwind = records.and_then(|(cie, fde)| {
        let at = buffer.address() + capacity;
        match frame::relocate_frame(&cie, &fde, src, dst, at) {
            Ok(records) => {
                relocated.extend_from_slice(&records);
                Some(at)
            }
            Err(error) => {
                log::warn!("unable to copy the unwind information of {:#x}: {error}", range.entry);
                None
            }
        }
    });
    fill(&mut relocated, buffer.len());

    // Safety: the window is open and nothing knows about the buffer yet
    unsafe {
        buffer.write(&relocated);
        cache::flush(buffer.as_ptr(), buffer.len());
        if let Some(at) = unwind {
            frame::register(at);
        }
    }

    log::debug!(
        "cloned {:#x} ({} bytes) to {:#x} ({} bytes)",
        range.entry,
        range.len,
        buffer.address(),
        buffer.len()
    );
    if log::log_enabled!(log::Level::Trace) {
        match code::disassemble::<Native>(&relocated[..capacity], dst) {
            Ok(listing) => log::trace!("relocated {:#x}:\n{listing}", range.entry),
            Err(error) => log::trace!("unable to list relocated {:#x}: {error}", range.entry),
        }
    }

    Ok(ClonedFunction {
        range,
        original,
        code: buffer,
        frame: unwind,
    })
}

/// Pads `code` with traps to exactly `len` bytes
fn fill(code: &mut Vec<u8>, len: usize) {
    while code.len() < len {
        code.extend_from_slice(Native::TRAP);
    }
    code.truncate(len);
}

/// Returns the copy of a function to `arena`
fn release(arena: &Arena, cloned: ClonedFunction) -> Result<(), ArenaError> {
    if let Some(at) = cloned.frame {
        // Safety: registered when the copy was made, and the copy is going away
        unsafe { frame::deregister(at) };
    }
    let _window = arena.begin_mutate()?;
    arena.free(cloned.code);
    Ok(())
}

/// Releases a copy that is no longer reachable, logging instead of failing when the arena refuses it
fn discard(arena: &Arena, address: usize, cloned: ClonedFunction) {
    if let Err(error) = release(arena, cloned) {
        log::warn!("unable to release the copy of {address:#x}: {error}");
    }
}

#[cfg(all(test, target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
mod tests {
    use std::hint::black_box;
    use std::thread;

    use std::panic;

    use super::*;
    use crate::code::RelocateError;
    use crate::function::ReceiverKind;
    use crate::patcher::read_code;

    #[inline(never)]
    fn a() -> &'static str {
        "a"
    }

    #[inline(never)]
    fn b() -> &'static str {
        "b"
    }

    #[test]
    /// A function returning "a" redefined to return "b" keeps "a" available and comes back on restore
    fn test_redefine_and_restore() {
        let f = a as fn() -> &'static str;
        let g = b as fn() -> &'static str;
        assert_eq!(black_box(f)(), "a");

        unsafe { redefine(f, g).unwrap() };
        assert_eq!(black_box(f)(), "b");
        assert_eq!(black_box(original(f))(), "a");
        assert!(is_redefined(f));

        unsafe { restore(f).unwrap() };
        assert_eq!(black_box(f)(), "a");
        assert!(!is_redefined(f));
        assert_eq!(original(f) as usize, f as usize);
    }

    static PRIMES: [u64; 8] = [2, 3, 5, 7, 11, 13, 17, 19];

    #[inline(never)]
    fn scramble(v: u64) -> u64 {
        v.wrapping_mul(0x9e37_79b9_7f4a_7c15).rotate_left(17)
    }

    /// Calls a function, branches and loads static data
    #[inline(never)]
    fn mixed(v: u64) -> u64 {
        let prime = PRIMES[(v % 8) as usize];
        let mut acc = prime;
        for i in 0..(v % 5) {
            acc = acc.wrapping_add(scramble(acc ^ i));
        }
        if v & 1 == 0 {
            acc ^ prime
        } else {
            scramble(acc)
        }
    }

    #[inline(never)]
    fn zero(_: u64) -> u64 {
        0
    }

    #[test]
    /// The copy computes the same results as the function did, including calls, branches and data loads
    fn test_original_preserved() {
        let f = mixed as fn(u64) -> u64;
        let expected: Vec<_> = (0..64).map(|v| black_box(f)(v)).collect();

        unsafe { redefine(f, zero as fn(u64) -> u64).unwrap() };
        let copy = original(f);
        assert_ne!(copy as usize, f as usize);
        for v in 0..64 {
            assert_eq!(black_box(f)(v), 0);
            assert_eq!(black_box(copy)(v), expected[v as usize]);
        }

        unsafe { restore(f).unwrap() };
        let restored: Vec<_> = (0..64).map(|v| black_box(f)(v)).collect();
        assert_eq!(restored, expected);
    }

    #[inline(never)]
    fn checksum(v: u32) -> u32 {
        v.wrapping_mul(2_654_435_761) ^ (v >> 3)
    }

    #[inline(never)]
    fn identity(v: u32) -> u32 {
        v
    }

    #[test]
    /// Restoring puts back exactly the bytes that were there
    fn test_restore_byte_for_byte() {
        let f = checksum as fn(u32) -> u32;
        let range = module::function_range(f as usize).unwrap();
        let before = unsafe { read_code(range.entry, range.len) };
        let listing = code::disassemble::<Native>(&before, range.entry as u64).unwrap();

        unsafe { redefine(f, identity as fn(u32) -> u32).unwrap() };
        assert_ne!(unsafe { read_code(range.entry, range.len) }, before);
        assert_eq!(black_box(f)(12), 12);

        unsafe { restore(f).unwrap() };
        let after = unsafe { read_code(range.entry, range.len) };
        assert_eq!(after, before);
        assert_eq!(code::disassemble::<Native>(&after, range.entry as u64).unwrap(), listing);
    }

    #[inline(never)]
    fn untouched(v: u8) -> u8 {
        v.wrapping_add(3)
    }

    #[test]
    /// Restoring a function that was never redefined succeeds and changes nothing
    fn test_restore_unredefined() {
        let f = untouched as fn(u8) -> u8;
        let range = module::function_range(f as usize).unwrap();
        let before = unsafe { read_code(range.entry, range.len) };

        unsafe { restore(f).unwrap() };
        assert_eq!(unsafe { read_code(range.entry, range.len) }, before);
        assert_eq!(original(f) as usize, f as usize);
        assert_eq!(black_box(f)(1), 4);
    }

    #[inline(never)]
    fn base(v: i32) -> i32 {
        v + 1
    }

    #[inline(never)]
    fn double(v: i32) -> i32 {
        v * 2
    }

    #[inline(never)]
    fn negate(v: i32) -> i32 {
        -v
    }

    #[test]
    /// Redefining after a restore behaves like a first redefinition
    fn test_round_trip() {
        let f = base as fn(i32) -> i32;
        unsafe {
            redefine(f, double as fn(i32) -> i32).unwrap();
            restore(f).unwrap();
            redefine(f, negate as fn(i32) -> i32).unwrap();
        }
        assert_eq!(black_box(f)(5), -5);
        assert_eq!(black_box(original(f))(5), 6);

        unsafe { restore(f).unwrap() };
        assert_eq!(black_box(f)(5), 6);
    }

    #[inline(never)]
    fn level() -> u16 {
        black_box(10)
    }

    #[inline(never)]
    fn level_20() -> u16 {
        black_box(20)
    }

    #[inline(never)]
    fn level_30() -> u16 {
        black_box(30)
    }

    #[test]
    /// A second redefinition moves the jump but keeps the first copy
    fn test_redefine_twice() {
        let f = level as fn() -> u16;
        unsafe { redefine(f, level_20 as fn() -> u16).unwrap() };
        let copy = original(f) as usize;

        unsafe { redefine(f, level_30 as fn() -> u16).unwrap() };
        assert_eq!(black_box(f)(), 30);
        assert_eq!(original(f) as usize, copy);
        assert_eq!(black_box(original(f))(), 10);

        unsafe { restore(f).unwrap() };
        assert_eq!(black_box(f)(), 10);
    }

    #[test]
    /// A function can't jump to itself
    fn test_self_redefinition() {
        let f = level as fn() -> u16;
        assert!(matches!(
            unsafe { redefine(f, f) },
            Err(Error::SelfRedefinition(address)) if address == f as usize
        ));
    }

    #[inline(never)]
    fn guarded(v: u64) -> u64 {
        v ^ 0xdead_beef
    }

    #[test]
    /// A failed redefinition leaves the code alone
    fn test_failed_redefinition_leaves_code() {
        let entry = (guarded as fn(u64) -> u64) as usize;
        let range = module::function_range(entry).unwrap();
        let before = unsafe { read_code(range.entry, range.len) };

        // the middle of a function is not a function
        let inside = unsafe { <fn(u64) -> u64>::from_ptr((entry + 1) as *const ()) };
        assert!(matches!(
            unsafe { redefine(inside, zero as fn(u64) -> u64) },
            Err(Error::Resolve(module::ResolveError::NotAFunction(_)))
        ));

        assert_eq!(unsafe { read_code(range.entry, range.len) }, before);
        assert!(!is_redefined(inside));
        assert_eq!(black_box(guarded as fn(u64) -> u64)(0), 0xdead_beef);
    }

    #[derive(Clone, Copy)]
    struct Meters(u32);

    #[derive(Clone, Copy)]
    struct Feet(u32);

    #[derive(Clone, Copy)]
    struct Wide(u64);

    impl Receiver for Meters {}
    impl Receiver for Feet {}
    impl Receiver for Wide {}

    impl Meters {
        #[inline(never)]
        fn describe(self, scale: u32) -> u32 {
            self.0 * scale
        }

        #[inline(never)]
        fn scaled(&self, scale: u32) -> u32 {
            self.0 * scale
        }
    }

    impl Feet {
        #[inline(never)]
        fn describe(self, scale: u32) -> u32 {
            self.0 * scale + 1
        }

        #[inline(never)]
        fn scaled(&self, scale: u32) -> u32 {
            self.0 * scale + 1
        }
    }

    impl Wide {
        #[inline(never)]
        fn describe(self, scale: u32) -> u32 {
            (self.0 as u32) * scale + 2
        }
    }

    #[test]
    /// Methods can be redefined with a receiver of the same layout
    fn test_redefine_method() {
        let f = Meters::describe as fn(Meters, u32) -> u32;
        let g = Feet::describe as fn(Feet, u32) -> u32;

        unsafe { redefine_method(f, g).unwrap() };
        assert_eq!(black_box(f)(Meters(3), 2), 7);
        assert_eq!(black_box(original(f))(Meters(3), 2), 6);

        unsafe { restore(f).unwrap() };
        assert_eq!(black_box(f)(Meters(3), 2), 6);
    }

    #[test]
    /// Receivers with a different layout are rejected before anything is touched
    fn test_receiver_mismatch() {
        let f = Meters::describe as fn(Meters, u32) -> u32;
        let g = Wide::describe as fn(Wide, u32) -> u32;

        assert!(matches!(
            unsafe { redefine_method(f, g) },
            Err(Error::ReceiverMismatch {
                original_size: 4,
                replacement_size: 8,
                ..
            })
        ));
        assert!(!is_redefined(f));
    }

    static THREE_METERS: Meters = Meters(3);

    #[test]
    /// `&self` methods can be redefined when the referenced types share a layout
    fn test_redefine_method_by_reference() {
        let f = Meters::scaled as fn(&'static Meters, u32) -> u32;
        let g = Feet::scaled as fn(&'static Feet, u32) -> u32;

        unsafe { redefine_method(f, g).unwrap() };
        assert_eq!(black_box(f)(&THREE_METERS, 2), 7);
        assert_eq!(black_box(original(f))(&THREE_METERS, 2), 6);

        unsafe { restore(f).unwrap() };
        assert_eq!(black_box(f)(&THREE_METERS, 2), 6);
    }

    struct Small(u32);

    struct Big([u64; 4]);

    impl Small {
        #[inline(never)]
        fn get(&self, offset: u32) -> u32 {
            self.0 + offset
        }
    }

    impl Big {
        #[inline(never)]
        fn get(&self, offset: u32) -> u32 {
            self.0[3] as u32 + offset
        }
    }

    #[test]
    /// References are compared by the size of what they point to, not by their own size
    fn test_reference_receiver_mismatch() {
        let f = Small::get as fn(&'static Small, u32) -> u32;
        let g = Big::get as fn(&'static Big, u32) -> u32;

        assert!(matches!(
            unsafe { redefine_method(f, g) },
            Err(Error::ReceiverMismatch {
                original_size: 4,
                replacement_size: 32,
                ..
            })
        ));
        assert!(!is_redefined(f));
    }

    #[test]
    /// A receiver taken by reference can't stand in for one taken by value
    fn test_receiver_kind_mismatch() {
        let f = Meters::scaled as fn(&'static Meters, u32) -> u32;
        let g = Feet::describe as fn(Feet, u32) -> u32;

        assert!(matches!(
            unsafe { redefine_method(f, g) },
            Err(Error::ReceiverKindMismatch {
                original: ReceiverKind::Pointer,
                replacement: ReceiverKind::Value,
            })
        ));
        assert!(!is_redefined(f));
    }

    #[inline(never)]
    fn fragile(v: u32) -> u32 {
        if black_box(v) > 5 {
            panic!("{v} is too large");
        }
        v * 2
    }

    #[inline(never)]
    fn sturdy(v: u32) -> u32 {
        v
    }

    #[test]
    /// A panic raised in the copy is caught like one raised in the function itself
    fn test_panic_in_original() {
        let f = fragile as fn(u32) -> u32;
        assert!(panic::catch_unwind(|| black_box(f)(7)).is_err());

        unsafe { redefine(f, sturdy as fn(u32) -> u32).unwrap() };
        let copy = original(f);
        assert_eq!(black_box(copy)(3), 6);
        assert!(panic::catch_unwind(|| black_box(copy)(7)).is_err());
        assert_eq!(black_box(f)(7), 7);

        unsafe { restore(f).unwrap() };
        assert!(panic::catch_unwind(|| black_box(f)(7)).is_err());
        assert_eq!(black_box(f)(3), 6);
    }

    #[inline(never)]
    fn anchored(v: u64) -> u64 {
        v.wrapping_mul(31)
    }

    #[test]
    /// A replacement beyond the reach of a jump is refused and nothing is written
    fn test_replacement_out_of_range() {
        let f = anchored as fn(u64) -> u64;
        let range = module::function_range(f as usize).unwrap();
        let before = unsafe { read_code(range.entry, range.len) };

        // never called
        let far = unsafe { <fn(u64) -> u64>::from_ptr((range.entry as u64 + (1 << 33)) as *const ()) };
        assert!(matches!(
            unsafe { redefine(f, far) },
            Err(Error::Relocate(RelocateError::OutOfRange { .. }))
        ));

        assert_eq!(unsafe { read_code(range.entry, range.len) }, before);
        assert!(!is_redefined(f));
        assert_eq!(black_box(f)(2), 62);
    }

    /// Code that loads an address 0x100 bytes past its start
    #[cfg(target_arch = "x86_64")]
    const FAR_LOAD: &[u8] = &[
        0x48, 0x8d, 0x05, 0x00, 0x01, 0x00, 0x00, // lea rax, [rip + 0x100]
        0xc3, // ret
    ];
    /// Code that loads an address 0x100 bytes past its start
    #[cfg(target_arch = "aarch64")]
    const FAR_LOAD: &[u8] = &[
        0x00, 0x08, 0x00, 0x10, // adr x0, #0x100
        0xc0, 0x03, 0x5f, 0xd6, // ret
    ];

    #[test]
    /// Code that can't be relocated into the arena gives its buffer back
    fn test_clone_failure_frees_buffer() {
        let arena = Arena::new();
        let range = FunctionRange {
            entry: 0x7000_0000_0000,
            len: FAR_LOAD.len(),
        };

        assert!(matches!(
            clone_function(&arena, range, FAR_LOAD.to_vec()),
            Err(Error::Relocate(RelocateError::OutOfRange { .. }))
        ));
        assert_eq!(arena.in_use(), 0);
        assert!(!arena.is_mutable());
    }

    #[inline(never)]
    fn tallied(v: u32) -> u32 {
        (0..v % 7).fold(v, |acc, i| acc.rotate_left(i) ^ 0x55)
    }

    #[test]
    /// A copy carries registered unwind information and is fully returned on release
    fn test_clone_and_release() {
        let arena = Arena::new();
        let f = tallied as fn(u32) -> u32;
        let range = module::function_range(f as usize).unwrap();

        let cloned = clone_function(&arena, range, unsafe { range.as_slice() }.to_vec()).unwrap();
        assert!(arena.in_use() > 0);
        assert!(cloned.frame.is_some());
        let copy = unsafe { <fn(u32) -> u32>::from_ptr(cloned.code.address() as *const ()) };
        assert_eq!(black_box(copy)(77), tallied(77));

        release(&arena, cloned).unwrap();
        assert_eq!(arena.in_use(), 0);
    }

    #[test]
    /// An arena that refuses to give memory back doesn't turn a finished restore into an error
    fn test_discard_unavailable_arena() {
        let arena = Arena::new();
        let f = tallied as fn(u32) -> u32;
        let range = module::function_range(f as usize).unwrap();
        let cloned = clone_function(&arena, range, unsafe { range.as_slice() }.to_vec()).unwrap();
        let held = arena.in_use();

        arena.disable();
        discard(&arena, range.entry, cloned);
        assert_eq!(arena.in_use(), held);
        assert!(!arena.is_mutable());
    }

    macro_rules! constants {
        ($($name:ident = $value:expr),* $(,)?) => {
            $(
                #[inline(never)]
                fn $name() -> u64 {
                    black_box($value)
                }
            )*
        };
    }

    constants!(
        c0 = 100, c1 = 101, c2 = 102, c3 = 103, c4 = 104, c5 = 105, c6 = 106, c7 = 107,
        r0 = 200, r1 = 201, r2 = 202, r3 = 203, r4 = 204, r5 = 205, r6 = 206, r7 = 207,
    );

    #[test]
    /// Threads redefining different functions don't interfere
    fn test_concurrent_distinct() {
        let pairs: Vec<(fn() -> u64, fn() -> u64)> = vec![
            (c0, r0),
            (c1, r1),
            (c2, r2),
            (c3, r3),
            (c4, r4),
            (c5, r5),
            (c6, r6),
            (c7, r7),
        ];

        let threads: Vec<_> = pairs
            .iter()
            .map(|&(f, g)| thread::spawn(move || unsafe { redefine(f, g) }))
            .collect();
        for thread in threads {
            thread.join().unwrap().unwrap();
        }

        for (i, &(f, _)) in pairs.iter().enumerate() {
            assert_eq!(black_box(f)(), 200 + i as u64);
            assert_eq!(black_box(original(f))(), 100 + i as u64);
        }

        let threads: Vec<_> = pairs
            .iter()
            .map(|&(f, _)| thread::spawn(move || unsafe { restore(f) }))
            .collect();
        for thread in threads {
            thread.join().unwrap().unwrap();
        }
        for (i, &(f, _)) in pairs.iter().enumerate() {
            assert_eq!(black_box(f)(), 100 + i as u64);
        }
    }

    constants!(contested = 1, first = 2, second = 3);

    #[test]
    /// Threads redefining the same function share one copy and the last jump wins
    fn test_concurrent_same() {
        let f = contested as fn() -> u64;
        let replacements = [first as fn() -> u64, second as fn() -> u64];

        let threads: Vec<_> = replacements
            .iter()
            .map(|&g| thread::spawn(move || unsafe { redefine(f, g).map(|_| original(f) as usize) }))
            .collect();
        let copies: Vec<_> = threads.into_iter().map(|t| t.join().unwrap().unwrap()).collect();

        assert_eq!(copies[0], copies[1]);
        assert!(matches!(black_box(f)(), 2 | 3));
        assert_eq!(black_box(original(f))(), 1);

        unsafe { restore(f).unwrap() };
        assert_eq!(black_box(f)(), 1);
    }
}
