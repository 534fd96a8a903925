//! Object-graph serialization for distributed objects
//!
//! This crate implements the coder used to move arguments, return values
//! and whole object graphs between address spaces:
//!
//! - [`Value`]: one typed datum
//! - [`ObjectGraph`]: arena of objects and pointees addressed by [`NodeId`]
//! - [`Encoder`] / [`Decoder`]: single-use sessions that preserve object
//!   identity, sharing and cycles
//! - [`native`]: conversion between values and host C layout

pub mod decoder;
pub mod encoder;
pub mod error;
pub mod graph;
pub mod native;
pub mod tags;
pub mod value;
pub mod wire;

pub use decoder::Decoder;
pub use encoder::{Encoder, MAX_DEPTH};
pub use error::{CoderError, Result};
pub use graph::{ClassRef, NodeId, ObjectGraph, ObjectNode};
pub use native::{is_plain_data, read_native, write_native};
pub use value::Value;
