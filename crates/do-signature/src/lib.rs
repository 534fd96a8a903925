//! Method signatures and call frames for distributed objects
//!
//! This crate provides:
//! - A parser for Objective-C style type-encoding strings
//! - Host C-ABI layout of encoded types
//! - [`MethodSignature`]: the parsed description of a method
//! - [`CallFrame`]: an aligned argument buffer built from a signature
//! - [`CallBackend`] and [`RegisterTrampoline`] for calling native functions
//!   with a populated frame

pub mod error;
pub mod frame;
pub mod invoke;
pub mod layout;
pub mod parser;
pub mod signature;
pub mod types;

pub use error::{Result, SignatureError};
pub use frame::{CallFrame, NativeScalar};
pub use invoke::{CallBackend, RegisterTrampoline};
pub use layout::{align_padding, struct_layout, struct_offsets, Layout};
pub use parser::{parse_method_types, parse_type_encoding};
pub use signature::{ArgumentInfo, MethodSignature};
pub use types::{Qualifiers, TypeEncoding};
