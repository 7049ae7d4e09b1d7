//! # kiln-common-core
//!
//! Core types for Kiln that are `no_std` compatible.
//!
//! This crate provides the foundational types shared by the heap and the VM:
//! - `Value` - the tagged 64-bit runtime value and its `Decoded` view
//! - `ShapeId` - structural type ids, including the built-in shape table
//! - `ErrorId` - internal status codes carried inside null values
//! - `Symbol` - interned symbol ids (and `SymbolInterner` with the std feature)

#![cfg_attr(not(feature = "std"), no_std)]

mod bits;
pub mod shape_id;
pub mod symbol;
pub mod value;

pub use shape_id::ShapeId;
pub use symbol::Symbol;
#[cfg(feature = "std")]
pub use symbol::SymbolInterner;
pub use value::{Address, Decoded, ErrorId, InlineBytes, Value};
