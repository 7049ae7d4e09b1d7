//! Interned symbols.

/// An interned name. The id is dense and starts at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl Symbol {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Symbol(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

#[cfg(feature = "std")]
pub use interner::SymbolInterner;

#[cfg(feature = "std")]
mod interner {
    use super::Symbol;
    use string_interner::{DefaultStringInterner, DefaultSymbol, Symbol as _};

    /// String-to-symbol table backed by `string-interner`.
    #[derive(Default)]
    pub struct SymbolInterner {
        inner: DefaultStringInterner,
    }

    impl std::fmt::Debug for SymbolInterner {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("SymbolInterner").field("len", &self.inner.len()).finish()
        }
    }

    impl SymbolInterner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn intern(&mut self, name: &str) -> Symbol {
            to_symbol(self.inner.get_or_intern(name))
        }

        pub fn get(&self, name: &str) -> Option<Symbol> {
            self.inner.get(name).map(to_symbol)
        }

        pub fn resolve(&self, symbol: Symbol) -> Option<&str> {
            let raw = DefaultSymbol::try_from_usize(symbol.as_u32() as usize)?;
            self.inner.resolve(raw)
        }

        pub fn len(&self) -> usize {
            self.inner.len()
        }

        pub fn is_empty(&self) -> bool {
            self.inner.is_empty()
        }
    }

    fn to_symbol(raw: DefaultSymbol) -> Symbol {
        Symbol::from_raw(raw.to_usize() as u32)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let mut interner = SymbolInterner::new();
        let a = interner.intern("message");
        let b = interner.intern("stack");
        assert_ne!(a, b);
        assert_eq!(interner.intern("message"), a);
        assert_eq!(interner.get("stack"), Some(b));
        assert_eq!(interner.get("missing"), None);
        assert_eq!(interner.resolve(a), Some("message"));
        assert_eq!(interner.len(), 2);
    }
}
