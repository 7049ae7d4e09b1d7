//! Strings and byte sequences.
//!
//! Up to 7 bytes are stored inline in the value. Longer data is a data
//! object: `ObjectHeader` with `count = byte length`, followed by the raw
//! bytes padded to 16.

use kiln_common_core::{ShapeId, Value};

use super::Allocate;
use crate::error::HeapError;
use crate::header::MAX_COUNT;
use crate::heap::Heap;

pub fn create_string<A: Allocate + ?Sized>(alloc: &A, text: &str) -> Result<Value, HeapError> {
    if let Some(value) = Value::small_string(text) {
        return Ok(value);
    }
    create_data(alloc, ShapeId::LARGE_STRING, text.as_bytes())
}

pub fn create_bytes<A: Allocate + ?Sized>(alloc: &A, data: &[u8]) -> Result<Value, HeapError> {
    if let Some(value) = Value::small_bytes(data) {
        return Ok(value);
    }
    create_data(alloc, ShapeId::LARGE_BYTES, data)
}

fn create_data<A: Allocate + ?Sized>(alloc: &A, shape: ShapeId, data: &[u8]) -> Result<Value, HeapError> {
    if data.len() > MAX_COUNT {
        return Err(HeapError::TooLarge { requested: data.len(), region_size: alloc.heap().region_size() });
    }
    let value = alloc.allocate_object(shape, data.len(), false, &mut [])?;
    alloc.heap().write_bytes(value.as_address(), data);
    Ok(value)
}

pub fn is_string(heap: &Heap, value: Value) -> bool {
    value.is_small_string() || (value.is_pointer() && heap.shape_of(value) == ShapeId::LARGE_STRING)
}

/// Raw bytes of a string or bytes value.
pub fn data(heap: &Heap, value: Value) -> Option<Vec<u8>> {
    if value.is_small_string() || value.is_small_bytes() {
        return Some(value.as_inline().as_bytes().to_vec());
    }
    if !value.is_pointer() {
        return None;
    }
    let header = heap.header(value.as_address());
    header
        .shape_id()
        .is_data()
        .then(|| heap.read_bytes(value.as_address(), header.count()))
}

pub fn to_string(heap: &Heap, value: Value) -> Option<String> {
    if !is_string(heap, value) {
        return None;
    }
    data(heap, value).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

pub fn len(heap: &Heap, value: Value) -> Option<usize> {
    if value.is_small_string() || value.is_small_bytes() {
        return Some(value.as_inline().len());
    }
    if value.is_pointer() {
        let header = heap.header(value.as_address());
        if header.shape_id().is_data() {
            return Some(header.count());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapConfig;
    use crate::objects::BufferAllocator;

    #[test]
    fn test_small_and_large_strings() {
        let heap = Heap::new(&HeapConfig { heap_size: 1 << 16, region_size: 4096, allocation_buffers: 1 }).unwrap();
        let alloc = BufferAllocator { heap: &heap, buffer: 0 };

        let short = create_string(&alloc, "hi").unwrap();
        assert!(short.is_small_string());
        assert_eq!(to_string(&heap, short).as_deref(), Some("hi"));

        let long = create_string(&alloc, "a considerably longer string").unwrap();
        assert!(long.is_young_pointer());
        assert_eq!(heap.shape_of(long), ShapeId::LARGE_STRING);
        assert_eq!(len(&heap, long), Some(28));
        assert_eq!(to_string(&heap, long).as_deref(), Some("a considerably longer string"));

        let bytes = create_bytes(&alloc, &[9u8; 20]).unwrap();
        assert!(!is_string(&heap, bytes));
        assert_eq!(data(&heap, bytes), Some(vec![9u8; 20]));
        assert_eq!(to_string(&heap, bytes), None);
    }
}
