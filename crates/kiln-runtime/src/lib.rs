//! # kiln-runtime
//!
//! The managed heap shared by every fiber:
//! - `heap` - region arena, allocation buffers, payload access
//! - `header` - the 16-byte object header
//! - `shape` - shapes and the transition tree
//! - `handle` - per-fiber precise roots
//! - `gc` - the stop-the-world generational collector
//! - `objects` - string, tuple and instance layouts
//! - `symbols` - the runtime symbol table

pub mod error;
pub mod gc;
pub mod handle;
pub mod header;
pub mod heap;
pub mod objects;
pub mod shape;
pub mod symbols;

pub use error::{HeapError, ShapeError};
pub use gc::{collect, GcStats, RootSet};
pub use handle::{Handle, HandleList, HandleScope};
pub use header::ObjectHeader;
pub use heap::{Heap, HeapConfig, RegionKind};
pub use objects::{Allocate, BufferAllocator};
pub use shape::{LookupResult, ShapeKey, ShapeTable};
pub use symbols::SymbolTable;

pub use kiln_common_core::{Address, Decoded, ErrorId, ShapeId, Symbol, Value};
