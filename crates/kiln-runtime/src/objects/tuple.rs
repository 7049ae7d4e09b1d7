//! Tuples: fixed-length sequences of values.
//!
//! Layout: `ObjectHeader` (`count` = length) followed by one word per element.

use kiln_common_core::{ShapeId, Value};

use super::Allocate;
use crate::error::HeapError;
use crate::heap::Heap;

pub fn create<A: Allocate + ?Sized>(alloc: &A, elements: &[Value]) -> Result<Value, HeapError> {
    let mut elements = elements.to_vec();
    let tuple = alloc.allocate_object(ShapeId::TUPLE, elements.len(), false, &mut elements)?;
    let heap = alloc.heap();
    for (i, element) in elements.iter().enumerate() {
        heap.store(tuple.as_address(), i, *element);
    }
    Ok(tuple)
}

pub fn is_tuple(heap: &Heap, value: Value) -> bool {
    value.is_pointer() && heap.shape_of(value) == ShapeId::TUPLE
}

#[inline]
pub fn len(heap: &Heap, tuple: Value) -> usize {
    heap.header(tuple.as_address()).count()
}

/// Element at `index`, or `ERROR_OUT_OF_BOUNDS`.
pub fn get(heap: &Heap, tuple: Value, index: usize) -> Value {
    if index >= len(heap, tuple) {
        return Value::ERROR_OUT_OF_BOUNDS;
    }
    heap.load(tuple.as_address(), index)
}

/// Returns `ERROR_OK` or `ERROR_OUT_OF_BOUNDS`.
pub fn set(heap: &Heap, tuple: Value, index: usize, value: Value) -> Value {
    if index >= len(heap, tuple) {
        return Value::ERROR_OUT_OF_BOUNDS;
    }
    heap.store(tuple.as_address(), index, value);
    Value::ERROR_OK
}

pub fn elements(heap: &Heap, tuple: Value) -> Vec<Value> {
    (0..len(heap, tuple)).map(|i| heap.load(tuple.as_address(), i)).collect()
}
