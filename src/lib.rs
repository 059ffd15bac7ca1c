#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod error;
pub mod function;
pub mod hook;
pub mod module;
pub mod patcher;
pub mod registry;

pub use error::Error;
pub use function::{Function, Method, Receiver, ReceiverKind};
pub use registry::{is_redefined, original, redefine, redefine_method, restore};
