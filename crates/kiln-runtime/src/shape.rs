//! Shapes and the shape transition tree.
//!
//! A shape is an ordered list of keys plus a parent link. Appending a key
//! to a shape always yields the same child shape, so instances built the
//! same way share one id. The children are cached in `additions`.

use hashbrown::HashMap;
use kiln_common_core::{ShapeId, Symbol};
use parking_lot::RwLock;

use crate::error::ShapeError;
use crate::symbols::SymbolTable;

/// Maximum number of fields per instance.
pub const MAX_FIELDS: usize = 256;

/// Key flag bits.
pub mod key_flags {
    pub const NONE: u8 = 0;
    /// Hidden from user-level reflection.
    pub const INTERNAL: u8 = 1;
    pub const READ_ONLY: u8 = 2;
    pub const PRIVATE: u8 = 4;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeKey {
    pub symbol: Symbol,
    pub flags: u8,
}

impl ShapeKey {
    pub fn new(symbol: Symbol, flags: u8) -> Self {
        Self { symbol, flags }
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & key_flags::READ_ONLY != 0
    }

    pub fn is_internal(&self) -> bool {
        self.flags & key_flags::INTERNAL != 0
    }

    pub fn is_private(&self) -> bool {
        self.flags & key_flags::PRIVATE != 0
    }
}

/// Result of [`ShapeTable::lookup_symbol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupResult {
    pub found: bool,
    pub offset: usize,
    pub key: Option<ShapeKey>,
}

impl LookupResult {
    pub const NOT_FOUND: LookupResult = LookupResult { found: false, offset: 0, key: None };

    pub fn flags(&self) -> u8 {
        self.key.map_or(0, |k| k.flags)
    }

    pub fn is_read_only(&self) -> bool {
        self.key.is_some_and(|k| k.is_read_only())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Shape {
    pub parent: Option<ShapeId>,
    pub keys: Vec<ShapeKey>,
    additions: HashMap<ShapeKey, ShapeId>,
}

impl Shape {
    fn root() -> Self {
        Self::default()
    }

    pub fn field_count(&self) -> usize {
        self.keys.len()
    }
}

/// Registry of every shape. Ids index into `shapes`.
#[derive(Debug)]
pub struct ShapeTable {
    shapes: RwLock<Vec<Shape>>,
}

impl ShapeTable {
    /// Create the table with all built-in shapes registered.
    pub fn new(symbols: &SymbolTable) -> Self {
        let mut shapes = vec![Shape::root(); ShapeId::FIRST_USER.as_index()];
        shapes[ShapeId::FIBER.as_index()] = builtin(symbols, ShapeId::INSTANCE, &fiber_fields::NAMES);
        shapes[ShapeId::EXCEPTION.as_index()] =
            builtin(symbols, ShapeId::INSTANCE, &exception_fields::NAMES);
        Self { shapes: RwLock::new(shapes) }
    }

    pub fn len(&self) -> usize {
        self.shapes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: ShapeId) -> bool {
        id.as_index() < self.len()
    }

    pub fn field_count(&self, id: ShapeId) -> usize {
        self.shapes.read().get(id.as_index()).map_or(0, Shape::field_count)
    }

    pub fn parent(&self, id: ShapeId) -> Option<ShapeId> {
        self.shapes.read().get(id.as_index()).and_then(|s| s.parent)
    }

    pub fn keys(&self, id: ShapeId) -> Vec<ShapeKey> {
        self.shapes.read().get(id.as_index()).map(|s| s.keys.clone()).unwrap_or_default()
    }

    /// Find `symbol` in the key table of `id`. Absence is a normal result.
    pub fn lookup_symbol(&self, id: ShapeId, symbol: Symbol) -> LookupResult {
        let shapes = self.shapes.read();
        let Some(shape) = shapes.get(id.as_index()) else {
            return LookupResult::NOT_FOUND;
        };
        match shape.keys.iter().position(|k| k.symbol == symbol) {
            Some(offset) => LookupResult { found: true, offset, key: Some(shape.keys[offset]) },
            None => LookupResult::NOT_FOUND,
        }
    }

    /// The shape reached by appending `symbol` to `id`, created on first use.
    pub fn add_key(&self, id: ShapeId, symbol: Symbol, flags: u8) -> Result<ShapeId, ShapeError> {
        let key = ShapeKey::new(symbol, flags);
        if let Some(existing) = self.transition(id, key)? {
            return Ok(existing);
        }

        let mut shapes = self.shapes.write();
        // another thread may have added the transition while we waited
        let parent = shapes.get(id.as_index()).ok_or(ShapeError::UnknownShape(id.as_u32()))?;
        if let Some(&child) = parent.additions.get(&key) {
            return Ok(child);
        }
        if parent.keys.len() >= MAX_FIELDS {
            return Err(ShapeError::TooManyFields { max: MAX_FIELDS });
        }
        if shapes.len() > ShapeId::MAX.as_index() {
            return Err(ShapeError::TooManyShapes);
        }

        let mut keys = parent.keys.clone();
        keys.push(key);
        let child = ShapeId::new(shapes.len() as u32);
        shapes.push(Shape { parent: Some(id), keys, additions: HashMap::new() });
        shapes[id.as_index()].additions.insert(key, child);
        log::trace!("shape {} + symbol {} -> shape {}", id.as_u32(), symbol.as_u32(), child.as_u32());
        Ok(child)
    }

    /// Build a shape with `keys` appended to the empty instance shape.
    pub fn shape_with_keys(&self, keys: &[(Symbol, u8)]) -> Result<ShapeId, ShapeError> {
        keys.iter()
            .try_fold(ShapeId::INSTANCE, |shape, &(symbol, flags)| self.add_key(shape, symbol, flags))
    }

    fn transition(&self, id: ShapeId, key: ShapeKey) -> Result<Option<ShapeId>, ShapeError> {
        let shapes = self.shapes.read();
        let shape = shapes.get(id.as_index()).ok_or(ShapeError::UnknownShape(id.as_u32()))?;
        Ok(shape.additions.get(&key).copied())
    }
}

fn builtin(symbols: &SymbolTable, parent: ShapeId, names: &[&str]) -> Shape {
    let keys = names
        .iter()
        .map(|name| ShapeKey::new(symbols.declare(name), key_flags::READ_ONLY | key_flags::INTERNAL))
        .collect();
    Shape { parent: Some(parent), keys, additions: HashMap::new() }
}

/// Field offsets of the built-in fiber shape.
pub mod fiber_fields {
    pub const ID: usize = 0;
    pub const RESULT: usize = 1;
    pub const EXCEPTION: usize = 2;
    pub const COUNT: usize = 3;
    pub(crate) const NAMES: [&str; COUNT] = ["id", "result", "exception"];
}

/// Field offsets of the built-in exception shape.
pub mod exception_fields {
    pub const MESSAGE: usize = 0;
    pub const STACK: usize = 1;
    pub const COUNT: usize = 2;
    pub(crate) const NAMES: [&str; COUNT] = ["message", "stack"];
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn table() -> (SymbolTable, ShapeTable) {
        let symbols = SymbolTable::new();
        let shapes = ShapeTable::new(&symbols);
        (symbols, shapes)
    }

    #[test]
    fn test_builtin_shapes() {
        let (symbols, shapes) = table();
        assert_eq!(shapes.len(), ShapeId::FIRST_USER.as_index());
        assert_eq!(shapes.field_count(ShapeId::FIBER), fiber_fields::COUNT);
        let message = symbols.declare("message");
        let result = shapes.lookup_symbol(ShapeId::EXCEPTION, message);
        assert!(result.found);
        assert_eq!(result.offset, exception_fields::MESSAGE);
        assert!(result.is_read_only());
    }

    #[test]
    fn test_transitions_are_shared() {
        let (symbols, shapes) = table();
        let x = symbols.declare("x");
        let y = symbols.declare("y");
        let a = shapes.add_key(ShapeId::INSTANCE, x, key_flags::NONE).unwrap();
        let b = shapes.add_key(a, y, key_flags::NONE).unwrap();
        assert_eq!(a, ShapeId::FIRST_USER);
        assert_eq!(shapes.add_key(ShapeId::INSTANCE, x, key_flags::NONE).unwrap(), a);
        assert_eq!(shapes.shape_with_keys(&[(x, 0), (y, 0)]).unwrap(), b);
        assert_eq!(shapes.parent(b), Some(a));
        assert_eq!(shapes.field_count(b), 2);

        // same symbol with different flags is a different transition
        let c = shapes.add_key(ShapeId::INSTANCE, x, key_flags::READ_ONLY).unwrap();
        assert_ne!(c, a);
    }

    #[test]
    fn test_lookup_missing_symbol() {
        let (symbols, shapes) = table();
        let z = symbols.declare("z");
        assert_eq!(shapes.lookup_symbol(ShapeId::INSTANCE, z), LookupResult::NOT_FOUND);
        assert_eq!(shapes.lookup_symbol(ShapeId::new(9999), z), LookupResult::NOT_FOUND);
    }

    #[test]
    fn test_field_limit() {
        let (symbols, shapes) = table();
        let mut shape = ShapeId::INSTANCE;
        for i in 0..MAX_FIELDS {
            shape = shapes.add_key(shape, symbols.declare(&format!("f{}", i)), 0).unwrap();
        }
        let extra = symbols.declare("extra");
        assert_eq!(shapes.add_key(shape, extra, 0), Err(ShapeError::TooManyFields { max: MAX_FIELDS }));
        assert_eq!(shapes.add_key(ShapeId::new(1 << 19), extra, 0), Err(ShapeError::UnknownShape(1 << 19)));
    }
}
