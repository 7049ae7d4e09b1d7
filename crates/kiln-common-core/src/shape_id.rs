//! Shape ids.
//!
//! Ids below `FIRST_USER` are reserved for built-in shapes. Immediate shapes
//! reuse the low tag bits of their encoding so a value's shape can be read
//! without touching the heap.

/// Identifier of a structural layout. Stable for the lifetime of a runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(u32);

impl ShapeId {
    pub const INT: ShapeId = ShapeId(0);
    pub const FLOAT: ShapeId = ShapeId(3);
    pub const BOOL: ShapeId = ShapeId(5);
    pub const SYMBOL: ShapeId = ShapeId(7);
    pub const NULL: ShapeId = ShapeId(11);
    pub const SMALL_STRING: ShapeId = ShapeId(13);
    pub const SMALL_BYTES: ShapeId = ShapeId(15);

    pub const LARGE_STRING: ShapeId = ShapeId(16);
    pub const LARGE_BYTES: ShapeId = ShapeId(17);
    pub const TUPLE: ShapeId = ShapeId(18);
    pub const INSTANCE: ShapeId = ShapeId(19);
    pub const FIBER: ShapeId = ShapeId(20);
    pub const EXCEPTION: ShapeId = ShapeId(21);

    /// First id handed out to shapes created at runtime.
    pub const FIRST_USER: ShapeId = ShapeId(22);

    /// Largest id the header can store.
    pub const MAX: ShapeId = ShapeId((1 << 20) - 1);

    #[inline]
    pub const fn new(raw: u32) -> Self {
        ShapeId(raw)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    /// Immediate shapes are encoded entirely inside the value word.
    #[inline]
    pub const fn is_immediate(self) -> bool {
        self.0 <= Self::SMALL_BYTES.0
    }

    /// Heap-allocated shapes.
    #[inline]
    pub const fn is_object(self) -> bool {
        !self.is_immediate()
    }

    /// Heap objects whose payload is raw bytes and never scanned by the collector.
    #[inline]
    pub const fn is_data(self) -> bool {
        self.0 == Self::LARGE_STRING.0 || self.0 == Self::LARGE_BYTES.0
    }

    /// Keyed objects whose fields are described by a shape table entry.
    #[inline]
    pub const fn is_instance(self) -> bool {
        self.0 >= Self::INSTANCE.0
    }

    #[inline]
    pub const fn is_exception(self) -> bool {
        self.0 == Self::EXCEPTION.0
    }

    #[inline]
    pub const fn is_builtin(self) -> bool {
        self.0 < Self::FIRST_USER.0
    }

    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 >= Self::FIRST_USER.0
    }

    /// Objects whose payload is a sequence of tagged values.
    #[inline]
    pub const fn has_value_fields(self) -> bool {
        self.0 == Self::TUPLE.0 || self.is_instance()
    }

    /// Human-readable name for built-in shapes.
    pub fn name(self) -> &'static str {
        match self {
            Self::INT => "int",
            Self::FLOAT => "float",
            Self::BOOL => "bool",
            Self::SYMBOL => "symbol",
            Self::NULL => "null",
            Self::SMALL_STRING | Self::LARGE_STRING => "string",
            Self::SMALL_BYTES | Self::LARGE_BYTES => "bytes",
            Self::TUPLE => "tuple",
            Self::INSTANCE => "instance",
            Self::FIBER => "fiber",
            Self::EXCEPTION => "exception",
            _ if self.is_user() => "instance",
            _ => "unknown",
        }
    }
}

/// Shape of each immediate, indexed by the low four tag bits.
///
/// Pointer tags map to `None`; their shape lives in the object header.
pub const IMMEDIATE_SHAPES: [Option<ShapeId>; 16] = [
    Some(ShapeId::INT),          // 0b0000
    None,                        // 0b0001 old pointer
    Some(ShapeId::INT),          // 0b0010
    Some(ShapeId::FLOAT),        // 0b0011
    Some(ShapeId::INT),          // 0b0100
    Some(ShapeId::BOOL),         // 0b0101
    Some(ShapeId::INT),          // 0b0110
    Some(ShapeId::SYMBOL),       // 0b0111
    Some(ShapeId::INT),          // 0b1000
    None,                        // 0b1001 young pointer
    Some(ShapeId::INT),          // 0b1010
    Some(ShapeId::NULL),         // 0b1011
    Some(ShapeId::INT),          // 0b1100
    Some(ShapeId::SMALL_STRING), // 0b1101
    Some(ShapeId::INT),          // 0b1110
    Some(ShapeId::SMALL_BYTES),  // 0b1111
];
