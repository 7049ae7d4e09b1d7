//! Handle stack discipline.

use kiln_runtime::{Handle, HandleList, HandleScope, Value};
use proptest::prelude::*;

/// Open one scope per level, pushing `levels[0]` handles before recursing.
fn nest(list: &HandleList, levels: &[usize], depth: i64) {
    let Some((&count, rest)) = levels.split_first() else {
        return;
    };
    let head_before = list.head();
    {
        let scope = HandleScope::new(list);
        let mut handles: Vec<Handle<'_>> =
            (0..count).map(|i| scope.handle(Value::int(depth * 100 + i as i64))).collect();

        nest(list, rest, depth + 1);

        for (i, handle) in handles.iter().enumerate() {
            assert_eq!(handle.get(), Value::int(depth * 100 + i as i64));
        }
        while let Some(handle) = handles.pop() {
            drop(handle);
        }
    }
    assert_eq!(list.head(), head_before);
}

proptest! {
    #[test]
    fn head_is_restored_after_nested_scopes(
        outer in 0usize..4,
        levels in proptest::collection::vec(0usize..6, 0..8),
    ) {
        let list = HandleList::new();
        let scope = HandleScope::new(&list);
        let mut pinned: Vec<Handle<'_>> = (0..outer).map(|i| scope.handle(Value::int(i as i64))).collect();
        let head = list.head();

        nest(&list, &levels, 1);

        prop_assert_eq!(list.head(), head);
        prop_assert_eq!(list.len(), outer);
        while let Some(handle) = pinned.pop() {
            drop(handle);
        }
        prop_assert_eq!(list.head(), None);
    }
}

#[test]
fn test_handles_link_to_previous() {
    let list = HandleList::new();
    let scope = HandleScope::new(&list);
    let a = scope.handle(Value::NULL);
    let b = scope.handle(Value::TRUE);
    let c = scope.handle(Value::FALSE);
    assert_eq!(a.prev(), None);
    assert_eq!(b.prev(), Some(0));
    assert_eq!(c.prev(), Some(1));
}
