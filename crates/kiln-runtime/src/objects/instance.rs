//! Shaped instances.
//!
//! Layout: `ObjectHeader` (`shape id`, `count` = field count) followed by
//! one value per key of the shape, in key order.

use kiln_common_core::{ShapeId, Symbol, Value};

use super::Allocate;
use crate::error::HeapError;
use crate::heap::Heap;
use crate::shape::ShapeTable;

/// Allocate an instance of `shape` with every field set to null.
pub fn create<A: Allocate + ?Sized>(alloc: &A, shapes: &ShapeTable, shape: ShapeId) -> Result<Value, HeapError> {
    create_with(alloc, shapes, shape, &[])
}

/// Allocate an instance whose leading fields are `fields`; the rest are null.
pub fn create_with<A: Allocate + ?Sized>(
    alloc: &A,
    shapes: &ShapeTable,
    shape: ShapeId,
    fields: &[Value],
) -> Result<Value, HeapError> {
    debug_assert!(shape.is_instance());
    let count = shapes.field_count(shape);
    debug_assert!(fields.len() <= count);
    let mut fields = fields.to_vec();
    let instance = alloc.allocate_object(shape, count, false, &mut fields)?;
    let heap = alloc.heap();
    for i in 0..count {
        heap.store(instance.as_address(), i, fields.get(i).copied().unwrap_or(Value::NULL));
    }
    Ok(instance)
}

pub fn is_instance(heap: &Heap, value: Value) -> bool {
    value.is_pointer() && heap.shape_of(value).is_instance()
}

#[inline]
pub fn field_at(heap: &Heap, instance: Value, offset: usize) -> Value {
    debug_assert!(offset < heap.header(instance.as_address()).count());
    heap.load(instance.as_address(), offset)
}

/// Write by offset, bypassing read-only flags.
#[inline]
pub fn set_field_at(heap: &Heap, instance: Value, offset: usize, value: Value) {
    debug_assert!(offset < heap.header(instance.as_address()).count());
    heap.store(instance.as_address(), offset, value);
}

/// Field named `symbol`, or `ERROR_NOT_FOUND`.
pub fn get_field(heap: &Heap, shapes: &ShapeTable, instance: Value, symbol: Symbol) -> Value {
    let lookup = shapes.lookup_symbol(heap.shape_of(instance), symbol);
    if !lookup.found {
        return Value::ERROR_NOT_FOUND;
    }
    field_at(heap, instance, lookup.offset)
}

/// Returns `ERROR_OK`, `ERROR_NOT_FOUND` or `ERROR_READ_ONLY`.
pub fn set_field(heap: &Heap, shapes: &ShapeTable, instance: Value, symbol: Symbol, value: Value) -> Value {
    let lookup = shapes.lookup_symbol(heap.shape_of(instance), symbol);
    if !lookup.found {
        return Value::ERROR_NOT_FOUND;
    }
    if lookup.is_read_only() {
        return Value::ERROR_READ_ONLY;
    }
    set_field_at(heap, instance, lookup.offset, value);
    Value::ERROR_OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::HeapConfig;
    use crate::objects::BufferAllocator;
    use crate::shape::key_flags;
    use crate::symbols::SymbolTable;

    #[test]
    fn test_field_access() {
        let heap = Heap::new(&HeapConfig { heap_size: 1 << 16, region_size: 4096, allocation_buffers: 1 }).unwrap();
        let alloc = BufferAllocator { heap: &heap, buffer: 0 };
        let symbols = SymbolTable::new();
        let shapes = ShapeTable::new(&symbols);

        let x = symbols.declare("x");
        let id = symbols.declare("id");
        let missing = symbols.declare("missing");
        let shape = shapes
            .shape_with_keys(&[(x, key_flags::NONE), (id, key_flags::READ_ONLY)])
            .unwrap();

        let obj = create(&alloc, &shapes, shape).unwrap();
        assert!(is_instance(&heap, obj));
        assert!(get_field(&heap, &shapes, obj, x).is_null());
        assert_eq!(set_field(&heap, &shapes, obj, x, Value::int(5)), Value::ERROR_OK);
        assert_eq!(get_field(&heap, &shapes, obj, x), Value::int(5));
        assert_eq!(set_field(&heap, &shapes, obj, id, Value::int(1)), Value::ERROR_READ_ONLY);
        assert_eq!(get_field(&heap, &shapes, obj, missing), Value::ERROR_NOT_FOUND);

        set_field_at(&heap, obj, 1, Value::int(77));
        assert_eq!(get_field(&heap, &shapes, obj, id), Value::int(77));
    }
}
