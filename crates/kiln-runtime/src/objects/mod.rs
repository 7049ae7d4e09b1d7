//! Heap object layouts.
//!
//! Every constructor goes through [`Allocate`], so the same code serves the
//! fiber runtime (which collects and retries on exhaustion) and plain heap
//! tests.

pub mod instance;
pub mod string;
pub mod tuple;

use kiln_common_core::{Address, ShapeId, Value};

use crate::error::HeapError;
use crate::heap::Heap;

/// Allocation entry point used by object constructors.
pub trait Allocate {
    fn heap(&self) -> &Heap;

    /// Allocate `size` payload bytes. An allocator that collects to make
    /// room keeps `roots` alive and rewrites them to their new locations.
    fn allocate_rooted(
        &self,
        size: usize,
        contains_external_heap_pointers: bool,
        roots: &mut [Value],
    ) -> Result<Address, HeapError>;

    fn allocate(&self, size: usize, contains_external_heap_pointers: bool) -> Result<Address, HeapError> {
        self.allocate_rooted(size, contains_external_heap_pointers, &mut [])
    }

    /// Allocate and stamp a header in one step.
    fn allocate_object(
        &self,
        shape: ShapeId,
        count: usize,
        pinned: bool,
        roots: &mut [Value],
    ) -> Result<Value, HeapError> {
        let address = self.allocate_rooted(crate::heap::payload_size(shape, count), pinned, roots)?;
        let heap = self.heap();
        heap.initialize_header(address, shape, count);
        Ok(heap.pointer(address))
    }
}

/// Allocates through a fixed buffer of a heap, without collecting.
#[derive(Debug, Clone, Copy)]
pub struct BufferAllocator<'h> {
    pub heap: &'h Heap,
    pub buffer: usize,
}

impl Allocate for BufferAllocator<'_> {
    fn heap(&self) -> &Heap {
        self.heap
    }

    fn allocate_rooted(
        &self,
        size: usize,
        contains_external_heap_pointers: bool,
        _roots: &mut [Value],
    ) -> Result<Address, HeapError> {
        self.heap.allocate(self.buffer, size, contains_external_heap_pointers)
    }
}
