//! # Function
//!
//! Typed function pointers that can be redefined.
//!
//! A redefinition works on raw code addresses, but callers hand over ordinary Rust function pointers.
//! [`Function`] is the only place where a pointer is turned into an address and back again, so the rest of the crate
//! never needs to know the exact signature it is working with.
//!
//! Function items must be coerced to pointers before use, e.g. `my_fn as fn(u32) -> u32`.
//! Functions taking references need an explicit lifetime in the pointer type (`fn(&'static Foo) -> u32`).

use std::alloc::Layout;
use std::mem;

/// A function pointer whose code can be redefined
///
/// # Safety
///
/// Implementors must be plain function pointers: `to_ptr` must return the entry point of the compiled code and
/// `from_ptr` must produce a pointer of the same type that calls the code at `ptr`.
pub unsafe trait Function: Sized + Copy + Send + Sync + 'static {
    /// Argument types as a tuple
    type Arguments;
    /// Return type
    type Output;

    /// Builds a function pointer from an entry address.
    ///
    /// # Safety
    ///
    /// `ptr` must point at executable code that follows this function's ABI and signature.
    unsafe fn from_ptr(ptr: *const ()) -> Self;

    /// Returns the entry address of the function.
    fn to_ptr(&self) -> *const ();

    /// Returns the entry address as an integer
    fn address(&self) -> usize {
        self.to_ptr() as usize
    }
}

/// A function whose first argument is a receiver (`self`)
///
/// # Safety
///
/// Same requirements as [`Function`].
pub unsafe trait Method: Function {
    /// Type of the first argument
    type Receiver: Receiver;
    /// Remaining arguments as a tuple
    type Rest;
}

/// How a receiver is handed to a method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverKind {
    /// The value itself
    Value,
    /// A pointer to the value
    Pointer,
}

/// A type that can be the first argument of a [`Method`]
///
/// Value receivers opt in with an empty impl (`impl Receiver for Meters {}`). References, raw pointers and boxes
/// report the type they point to, so `&self` methods are compared by what they read rather than by pointer size.
pub trait Receiver: Sized {
    /// How the receiver is passed
    const KIND: ReceiverKind = ReceiverKind::Value;

    /// Layout of the value the method works on: the receiver itself, or the type it points to
    fn target_layout() -> Layout {
        Layout::new::<Self>()
    }
}

/// Implements [`Receiver`] for pointer types, describing their pointee
macro_rules! impl_pointer_receiver {
    ($(impl<$($generic:tt),*> for $pointer:ty;)*) => {
        $(
            impl<$($generic),*> Receiver for $pointer {
                const KIND: ReceiverKind = ReceiverKind::Pointer;

                fn target_layout() -> Layout {
                    Layout::new::<T>()
                }
            }
        )*
    };
}

impl_pointer_receiver! {
    impl<'a, T> for &'a T;
    impl<'a, T> for &'a mut T;
    impl<T> for *const T;
    impl<T> for *mut T;
    impl<T> for Box<T>;
}

/// Implements [`Receiver`] for types passed by value
macro_rules! impl_value_receiver {
    ($($value:ty),*) => {
        $(impl Receiver for $value {})*
    };
}

impl_value_receiver!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize, f32, f64, bool, char);

/// Implements [`Function`] (and [`Method`] when there is at least one argument) for all pointer flavours of one arity
macro_rules! impl_function {
    () => {
        impl_function!(@function fn() -> Ret;);
        impl_function!(@function unsafe fn() -> Ret;);
        impl_function!(@function extern "C" fn() -> Ret;);
        impl_function!(@function unsafe extern "C" fn() -> Ret;);
    };
    ($head:ident $(, $tail:ident)*) => {
        impl_function!(@both fn($head $(, $tail)*) -> Ret; $head $(, $tail)*);
        impl_function!(@both unsafe fn($head $(, $tail)*) -> Ret; $head $(, $tail)*);
        impl_function!(@both extern "C" fn($head $(, $tail)*) -> Ret; $head $(, $tail)*);
        impl_function!(@both unsafe extern "C" fn($head $(, $tail)*) -> Ret; $head $(, $tail)*);
    };
    (@both $fn_type:ty; $head:ident $(, $tail:ident)*) => {
        impl_function!(@function $fn_type; $head $(, $tail)*);

        unsafe impl<Ret: 'static, $head: Receiver + 'static $(, $tail: 'static)*> Method for $fn_type {
            type Receiver = $head;
            type Rest = ($($tail,)*);
        }
    };
    (@function $fn_type:ty; $($arg:ident),*) => {
        unsafe impl<Ret: 'static $(, $arg: 'static)*> Function for $fn_type {
            type Arguments = ($($arg,)*);
            type Output = Ret;

            unsafe fn from_ptr(ptr: *const ()) -> Self {
                mem::transmute(ptr)
            }

            fn to_ptr(&self) -> *const () {
                *self as *const ()
            }
        }
    };
}

impl_function!();
impl_function!(A);
impl_function!(A, B);
impl_function!(A, B, C);
impl_function!(A, B, C, D);
impl_function!(A, B, C, D, E);
impl_function!(A, B, C, D, E, F);
impl_function!(A, B, C, D, E, F, G);
impl_function!(A, B, C, D, E, F, G, H);
