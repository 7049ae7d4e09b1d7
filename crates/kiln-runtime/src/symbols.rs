//! Runtime symbol table.
//!
//! Maps names to `Symbol` ids and caches the string value produced for
//! each symbol the first time it is looked up. Cached values that live on
//! the heap are collector roots.

use hashbrown::HashMap;
use kiln_common_core::{Symbol, SymbolInterner, Value};
use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct SymbolTable {
    names: RwLock<SymbolInterner>,
    values: RwLock<HashMap<Symbol, Value>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&self, name: &str) -> Symbol {
        if let Some(symbol) = self.names.read().get(name) {
            return symbol;
        }
        self.names.write().intern(name)
    }

    pub fn get(&self, name: &str) -> Option<Symbol> {
        self.names.read().get(name)
    }

    pub fn name(&self, symbol: Symbol) -> Option<String> {
        self.names.read().resolve(symbol).map(str::to_owned)
    }

    pub fn len(&self) -> usize {
        self.names.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cached_value(&self, symbol: Symbol) -> Option<Value> {
        self.values.read().get(&symbol).copied()
    }

    /// Cache the string value for `symbol`. The first value stored wins.
    pub fn cache_value(&self, symbol: Symbol, value: Value) -> Value {
        *self.values.write().entry(symbol).or_insert(value)
    }

    /// Visit every cached heap value, replacing it with the visitor's result.
    pub fn visit_values(&self, visitor: &mut dyn FnMut(Value) -> Value) {
        for value in self.values.write().values_mut() {
            if value.is_pointer() {
                *value = visitor(*value);
            }
        }
    }
}
