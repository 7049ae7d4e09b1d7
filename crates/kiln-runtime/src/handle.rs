//! Handles: precise roots for native code.
//!
//! Native code that keeps a heap value across a call that may allocate or
//! collect registers it through a `HandleScope`. Each fiber owns one
//! `HandleList`; handles are pushed on creation and popped on drop, so the
//! list always mirrors the lexical nesting of the native call stack.
//!
//! ```ignore
//! let scope = HandleScope::new(ctx.handles());
//! let name = scope.handle(string);
//! let obj = scope.handle(instance);
//! // ... allocation may move both objects ...
//! let moved = name.get();
//! ```

use std::marker::PhantomData;

use kiln_common_core::Value;
use parking_lot::Mutex;

/// Per-fiber stack of rooted values.
#[derive(Debug, Default)]
pub struct HandleList {
    slots: Mutex<Vec<Value>>,
}

impl HandleList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index of the most recently pushed handle.
    pub fn head(&self) -> Option<usize> {
        self.slots.lock().len().checked_sub(1)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, value: Value) -> (usize, Option<usize>) {
        let mut slots = self.slots.lock();
        let prev = slots.len().checked_sub(1);
        slots.push(value);
        (slots.len() - 1, prev)
    }

    fn pop(&self, index: usize) {
        let mut slots = self.slots.lock();
        if std::thread::panicking() {
            slots.truncate(index);
            return;
        }
        debug_assert_eq!(slots.len().checked_sub(1), Some(index), "handle released out of LIFO order");
        slots.truncate(index);
    }

    /// Visit every slot from the head down, replacing it with the visitor's result.
    pub fn visit_slots(&self, visitor: &mut dyn FnMut(Value) -> Value) {
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut().rev() {
            *slot = visitor(*slot);
        }
    }

    /// Drop every slot. Used when a fiber is recycled.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

/// Scoped registration point for handles of one fiber.
pub struct HandleScope<'l> {
    list: &'l HandleList,
    base: usize,
    _not_send: PhantomData<*const ()>,
}

impl<'l> HandleScope<'l> {
    pub fn new(list: &'l HandleList) -> Self {
        Self { list, base: list.len(), _not_send: PhantomData }
    }

    pub fn handle(&self, value: Value) -> Handle<'_> {
        let (index, prev) = self.list.push(value);
        Handle { list: self.list, index, prev, _scope: PhantomData }
    }
}

impl Drop for HandleScope<'_> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert_eq!(self.list.len(), self.base, "handle scope closed with live handles");
        }
    }
}

/// One rooted value. Reads always observe the current (possibly relocated) value.
pub struct Handle<'s> {
    list: &'s HandleList,
    index: usize,
    prev: Option<usize>,
    _scope: PhantomData<&'s HandleScope<'s>>,
}

impl Handle<'_> {
    pub fn get(&self) -> Value {
        self.list.slots.lock()[self.index]
    }

    pub fn set(&self, value: Value) {
        self.list.slots.lock()[self.index] = value;
    }

    /// Index of the handle pushed before this one.
    pub fn prev(&self) -> Option<usize> {
        self.prev
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        self.list.pop(self.index);
    }
}

impl std::fmt::Debug for Handle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("index", &self.index).field("value", &self.get()).finish()
    }
}
