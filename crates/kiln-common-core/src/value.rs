//! Tagged values.
//!
//! A `Value` is one 64-bit word. Immediates (ints, floats, bools, symbols,
//! null, short strings and byte sequences) are stored inline; everything
//! else is a 16-byte aligned heap address plus a generation bit.
//!
//! The `as_*` decoders do not check the tag outside of debug builds.
//! Callers test with the matching `is_*` predicate first, or go through
//! [`Value::decode`] which is always safe.

use core::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::bits;
use crate::shape_id::{ShapeId, IMMEDIATE_SHAPES};
use crate::symbol::Symbol;

// =============================================================================
// ErrorId
// =============================================================================

/// Internal status codes carried in the spare bits of a null value.
///
/// These never reach user code; they are the side channel between runtime
/// primitives (field lookup, bounds checks) and their callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ErrorId {
    None = 0,
    Ok = 1,
    NotFound = 2,
    OutOfBounds = 3,
    Exception = 4,
    ReadOnly = 5,
}

impl ErrorId {
    pub const NO_BASE_CLASS: ErrorId = ErrorId::NotFound;
}

// =============================================================================
// Address
// =============================================================================

/// Byte offset of an object's payload inside the heap arena.
///
/// Always a non-zero multiple of 16; the 16-byte header sits directly
/// before it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(u64);

impl Address {
    #[inline]
    pub const fn new(offset: u64) -> Self {
        debug_assert!(offset != 0);
        debug_assert!(offset % bits::OBJECT_ALIGNMENT == 0);
        Address(offset)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{:#x}", self.0)
    }
}

// =============================================================================
// InlineBytes
// =============================================================================

/// Payload of a small string or small bytes value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InlineBytes {
    len: u8,
    data: [u8; 7],
}

impl InlineBytes {
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Returns `None` if the bytes are not valid UTF-8.
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(self.as_bytes()).ok()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for InlineBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => write!(f, "{:?}", s),
            None => write!(f, "{:?}", self.as_bytes()),
        }
    }
}

// =============================================================================
// Decoded
// =============================================================================

/// Exhaustive view of a value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    Int(i64),
    Float(f64),
    Bool(bool),
    Symbol(Symbol),
    Null,
    Error(ErrorId),
    SmallString(InlineBytes),
    SmallBytes(InlineBytes),
    Pointer { address: Address, young: bool },
}

// =============================================================================
// Value
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Value(u64);

impl Value {
    pub const NULL: Value = Value::error(ErrorId::None);
    pub const TRUE: Value = Value::bool(true);
    pub const FALSE: Value = Value::bool(false);
    pub const ZERO: Value = Value(0);

    pub const ERROR_OK: Value = Value::error(ErrorId::Ok);
    pub const ERROR_NOT_FOUND: Value = Value::error(ErrorId::NotFound);
    pub const ERROR_OUT_OF_BOUNDS: Value = Value::error(ErrorId::OutOfBounds);
    pub const ERROR_EXCEPTION: Value = Value::error(ErrorId::Exception);
    pub const ERROR_READ_ONLY: Value = Value::error(ErrorId::ReadOnly);
    pub const ERROR_NO_BASE_CLASS: Value = Value::error(ErrorId::NO_BASE_CLASS);

    pub const INT_MIN: i64 = bits::INT_MIN;
    pub const INT_MAX: i64 = bits::INT_MAX;

    /// Largest payload stored inline by `small_string` / `small_bytes`.
    pub const SMALL_MAX_LENGTH: usize = bits::SMALL_MAX_LENGTH;

    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Value(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    // ---- encoders ----

    /// Encodes an integer. Values outside `[INT_MIN, INT_MAX]` are stored
    /// as floats instead of wrapping.
    #[inline]
    pub fn int(value: i64) -> Self {
        match Self::try_int(value) {
            Some(v) => v,
            None => Self::float(value as f64),
        }
    }

    #[inline]
    pub const fn try_int(value: i64) -> Option<Self> {
        if bits::int_fits(value) {
            Some(Value(bits::encode_int(value)))
        } else {
            None
        }
    }

    /// Encodes the low 63 bits of `value`, discarding the top bit.
    #[inline]
    pub const fn int_truncate(value: i64) -> Self {
        Value(bits::encode_int(value))
    }

    /// Encodes a float. The 4 lowest mantissa bits are dropped and NaN
    /// payloads are canonicalized.
    ///
    /// For normal floats the relative error is below `2^-48`. Subnormals
    /// lose up to `15 * 2^-1074` absolute, so the smallest ones flush to
    /// zero.
    #[inline]
    pub fn float(value: f64) -> Self {
        Value(bits::encode_float(value))
    }

    #[inline]
    pub const fn bool(value: bool) -> Self {
        Value(bits::BOOL_TAG | ((value as u64) << bits::BOOL_SHIFT))
    }

    #[inline]
    pub const fn symbol(symbol: Symbol) -> Self {
        Value(bits::SYMBOL_TAG | ((symbol.as_u32() as u64) << bits::SYMBOL_SHIFT))
    }

    #[inline]
    pub const fn error(id: ErrorId) -> Self {
        Value(bits::NULL_TAG | ((id as u64) << bits::ERROR_SHIFT))
    }

    #[inline]
    pub const fn pointer(address: Address, young: bool) -> Self {
        Value(bits::encode_pointer(address.as_u64(), young))
    }

    /// Inline string of at most 7 bytes.
    pub fn small_string(text: &str) -> Option<Self> {
        Self::small(bits::SMALL_STRING_TAG, text.as_bytes())
    }

    /// Inline byte sequence of at most 7 bytes.
    pub fn small_bytes(data: &[u8]) -> Option<Self> {
        Self::small(bits::SMALL_BYTES_TAG, data)
    }

    fn small(tag: u64, data: &[u8]) -> Option<Self> {
        if data.len() > bits::SMALL_MAX_LENGTH {
            return None;
        }
        let mut buf = [0u8; 7];
        buf[..data.len()].copy_from_slice(data);
        Some(Value(bits::encode_small(tag, &buf, data.len())))
    }

    // ---- predicates ----

    #[inline]
    pub const fn is_int(self) -> bool {
        bits::is_int(self.0)
    }

    #[inline]
    pub const fn is_float(self) -> bool {
        bits::tag(self.0) == bits::FLOAT_TAG
    }

    #[inline]
    pub const fn is_number(self) -> bool {
        self.is_int() || self.is_float()
    }

    #[inline]
    pub const fn is_bool(self) -> bool {
        bits::tag(self.0) == bits::BOOL_TAG
    }

    #[inline]
    pub const fn is_symbol(self) -> bool {
        bits::tag(self.0) == bits::SYMBOL_TAG
    }

    /// Plain null, not carrying an error id.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    /// Null tag carrying any error id other than `None`.
    #[inline]
    pub const fn is_error(self) -> bool {
        bits::tag(self.0) == bits::NULL_TAG && !self.is_null()
    }

    #[inline]
    pub const fn is_error_ok(self) -> bool {
        self.0 == Self::ERROR_OK.0
    }

    #[inline]
    pub const fn is_error_exception(self) -> bool {
        self.0 == Self::ERROR_EXCEPTION.0
    }

    #[inline]
    pub const fn is_small_string(self) -> bool {
        bits::tag(self.0) == bits::SMALL_STRING_TAG
    }

    #[inline]
    pub const fn is_small_bytes(self) -> bool {
        bits::tag(self.0) == bits::SMALL_BYTES_TAG
    }

    /// True iff the value references a heap object.
    #[inline]
    pub const fn is_pointer(self) -> bool {
        bits::is_pointer_tag(self.0) && bits::decode_address(self.0) != 0
    }

    #[inline]
    pub const fn is_young_pointer(self) -> bool {
        bits::tag(self.0) == bits::YOUNG_POINTER_TAG && self.is_pointer()
    }

    #[inline]
    pub const fn is_old_pointer(self) -> bool {
        bits::tag(self.0) == bits::OLD_POINTER_TAG && self.is_pointer()
    }

    /// Storing `stored` into the object `self` creates an old-to-young edge.
    #[inline]
    pub const fn requires_write_barrier(self, stored: Value) -> bool {
        self.is_old_pointer() && (stored.0 & bits::YOUNG_BIT != 0) && stored.is_pointer()
    }

    // ---- unchecked decoders ----

    #[inline]
    pub fn as_int(self) -> i64 {
        debug_assert!(self.is_int(), "as_int on {:?}", self);
        bits::decode_int(self.0)
    }

    #[inline]
    pub fn as_float(self) -> f64 {
        debug_assert!(self.is_float(), "as_float on {:?}", self);
        bits::decode_float(self.0)
    }

    /// Numeric value of an int or float.
    #[inline]
    pub fn as_f64(self) -> f64 {
        if self.is_int() {
            self.as_int() as f64
        } else {
            self.as_float()
        }
    }

    #[inline]
    pub fn as_bool(self) -> bool {
        debug_assert!(self.is_bool(), "as_bool on {:?}", self);
        (self.0 >> bits::BOOL_SHIFT) & 1 == 1
    }

    #[inline]
    pub fn as_symbol(self) -> Symbol {
        debug_assert!(self.is_symbol(), "as_symbol on {:?}", self);
        Symbol::from_raw((self.0 >> bits::SYMBOL_SHIFT) as u32)
    }

    #[inline]
    pub fn as_error(self) -> ErrorId {
        debug_assert!(bits::tag(self.0) == bits::NULL_TAG, "as_error on {:?}", self);
        let id = ((self.0 >> bits::ERROR_SHIFT) & bits::ERROR_MASK) as u8;
        ErrorId::try_from(id).unwrap_or(ErrorId::None)
    }

    #[inline]
    pub fn as_address(self) -> Address {
        debug_assert!(self.is_pointer(), "as_address on {:?}", self);
        Address::new(bits::decode_address(self.0))
    }

    #[inline]
    pub fn as_inline(self) -> InlineBytes {
        debug_assert!(self.is_small_string() || self.is_small_bytes());
        InlineBytes {
            len: bits::small_length(self.0) as u8,
            data: bits::small_data(self.0),
        }
    }

    /// Same address with the generation bit replaced.
    #[inline]
    pub fn with_generation(self, young: bool) -> Self {
        Self::pointer(self.as_address(), young)
    }

    // ---- checked views ----

    pub fn decode(self) -> Decoded {
        if self.is_int() {
            return Decoded::Int(bits::decode_int(self.0));
        }
        match bits::tag(self.0) {
            bits::OLD_POINTER_TAG | bits::YOUNG_POINTER_TAG if self.is_pointer() => Decoded::Pointer {
                address: self.as_address(),
                young: self.0 & bits::YOUNG_BIT != 0,
            },
            bits::FLOAT_TAG => Decoded::Float(self.as_float()),
            bits::BOOL_TAG => Decoded::Bool(self.as_bool()),
            bits::SYMBOL_TAG => Decoded::Symbol(self.as_symbol()),
            bits::SMALL_STRING_TAG => Decoded::SmallString(self.as_inline()),
            bits::SMALL_BYTES_TAG => Decoded::SmallBytes(self.as_inline()),
            bits::NULL_TAG => match self.as_error() {
                ErrorId::None => Decoded::Null,
                id => Decoded::Error(id),
            },
            // a pointer tag with a zero address is treated as null
            _ => Decoded::Null,
        }
    }

    /// Shape of an immediate. `None` for heap pointers.
    #[inline]
    pub fn shape_id(self) -> Option<ShapeId> {
        IMMEDIATE_SHAPES[bits::tag(self.0) as usize]
    }

    pub fn truthy(self) -> bool {
        match self.decode() {
            Decoded::Int(i) => i != 0,
            Decoded::Float(f) => f != 0.0 && !f.is_nan(),
            Decoded::Bool(b) => b,
            Decoded::Null | Decoded::Error(_) => false,
            _ => true,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::NULL
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Decoded::Int(i) => write!(f, "{}", i),
            Decoded::Float(x) => write!(f, "{:?}", x),
            Decoded::Bool(b) => write!(f, "{}", b),
            Decoded::Symbol(s) => write!(f, "symbol({})", s.as_u32()),
            Decoded::Null => write!(f, "null"),
            Decoded::Error(id) => write!(f, "error({:?})", id),
            Decoded::SmallString(s) | Decoded::SmallBytes(s) => write!(f, "{:?}", s),
            Decoded::Pointer { address, young } => {
                write!(f, "{}{:?}", if young { "young" } else { "old" }, address)
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::bool(value)
    }
}

impl From<Symbol> for Value {
    fn from(value: Symbol) -> Self {
        Value::symbol(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_range() {
        assert_eq!(Value::int(0).as_int(), 0);
        assert_eq!(Value::int(-1).as_int(), -1);
        assert_eq!(Value::int(Value::INT_MAX).as_int(), Value::INT_MAX);
        assert_eq!(Value::int(Value::INT_MIN).as_int(), Value::INT_MIN);
        assert!(Value::try_int(Value::INT_MAX + 1).is_none());
        assert!(Value::int(Value::INT_MAX + 1).is_float());
        assert!(Value::int(i64::MIN).is_float());
    }

    #[test]
    fn test_float_close_to() {
        let cases = [25.1234, -13.5, 0.0, 1e300, -0.000001];
        for f in cases {
            let decoded = Value::float(f).as_float();
            assert!((decoded - f).abs() <= 1e-9 * f.abs().max(1.0), "{} -> {}", f, decoded);
        }
        assert!(Value::float(f64::NAN).as_float().is_nan());
        assert_eq!(Value::float(f64::INFINITY).as_float(), f64::INFINITY);
    }

    #[test]
    fn test_subnormal_floats_have_absolute_error() {
        let step = f64::from_bits(1);
        assert_eq!(Value::float(5e-324).as_float(), 0.0);
        assert_eq!(Value::float(-f64::from_bits(15)).as_float(), -0.0);
        let f = 1e-320;
        assert!((Value::float(f).as_float() - f).abs() <= 15.0 * step);
        assert_eq!(Value::float(f64::from_bits(32)).as_float(), f64::from_bits(32));
    }

    #[test]
    fn test_bool_and_symbol() {
        assert!(Value::TRUE.as_bool());
        assert!(!Value::FALSE.as_bool());
        let sym = Symbol::from_raw(0xdead_beef);
        assert_eq!(Value::symbol(sym).as_symbol(), sym);
    }

    #[test]
    fn test_null_and_errors() {
        assert!(Value::NULL.is_null());
        assert!(!Value::NULL.is_error());
        assert!(Value::ERROR_EXCEPTION.is_error());
        assert!(Value::ERROR_EXCEPTION.is_error_exception());
        assert_eq!(Value::ERROR_NO_BASE_CLASS, Value::ERROR_NOT_FOUND);
        assert_eq!(Value::ERROR_READ_ONLY.decode(), Decoded::Error(ErrorId::ReadOnly));
        assert_eq!(Value::NULL.decode(), Decoded::Null);
    }

    #[test]
    fn test_small_strings() {
        let v = Value::small_string("hello").unwrap();
        assert!(v.is_small_string());
        assert_eq!(v.as_inline().as_str(), Some("hello"));
        assert_eq!(Value::small_string("").unwrap().as_inline().len(), 0);
        assert_eq!(Value::small_string("äöü").unwrap().as_inline().len(), 6);
        assert!(Value::small_string("eight ch").is_none());

        let b = Value::small_bytes(&[0, 1, 255]).unwrap();
        assert!(b.is_small_bytes());
        assert_eq!(b.as_inline().as_bytes(), &[0, 1, 255]);
    }

    #[test]
    fn test_pointers() {
        let old = Value::pointer(Address::new(0x40), false);
        let young = Value::pointer(Address::new(0x40), true);
        assert!(old.is_pointer() && old.is_old_pointer() && !old.is_young_pointer());
        assert!(young.is_pointer() && young.is_young_pointer());
        assert_eq!(young.as_address(), Address::new(0x40));
        assert_eq!(young.with_generation(false), old);
        assert!(old.requires_write_barrier(young));
        assert!(!young.requires_write_barrier(young));
        assert!(!old.requires_write_barrier(old));
        assert!(!old.requires_write_barrier(Value::int(9)));
        assert_eq!(old.shape_id(), None);
    }

    #[test]
    fn test_truthy() {
        assert!(!Value::int(0).truthy());
        assert!(Value::int(3).truthy());
        assert!(!Value::float(f64::NAN).truthy());
        assert!(!Value::NULL.truthy());
        assert!(!Value::ERROR_OK.truthy());
        assert!(Value::small_string("").unwrap().truthy());
    }

    #[test]
    fn test_shape_ids() {
        assert_eq!(Value::int(4).shape_id(), Some(ShapeId::INT));
        assert_eq!(Value::float(1.5).shape_id(), Some(ShapeId::FLOAT));
        assert_eq!(Value::TRUE.shape_id(), Some(ShapeId::BOOL));
        assert_eq!(Value::NULL.shape_id(), Some(ShapeId::NULL));
        assert_eq!(Value::ERROR_OK.shape_id(), Some(ShapeId::NULL));
        assert_eq!(Value::small_bytes(b"x").unwrap().shape_id(), Some(ShapeId::SMALL_BYTES));
    }
}
