//! Bit-level layout of tagged values.
//!
//! Every shift and mask used by `Value` lives here. Nothing outside this
//! module reaches into the raw word.
//!
//! ```text
//! ******** ... ******* 0        int (63-bit, shifted left by 1)
//! address  ...   0 0001         old-generation pointer
//! address  ...   1 0001         young-generation pointer
//! DDDDDDDD ...  DDDD 0011       float (top 60 bits of the double)
//! ******** ... B ******** 0101  bool (bit 8)
//! SSSS(32) ********  0111       symbol
//! ******** ...  EEEE 1011       null / internal error
//! data (7 bytes)  LLLL 1101     small string
//! data (7 bytes)  LLLL 1111     small bytes
//! ```

pub const INT_MASK: u64 = 0b1;
pub const INT_TAG: u64 = 0b0;
pub const INT_SHIFT: u32 = 1;
pub const INT_MIN: i64 = -(1 << 62);
pub const INT_MAX: i64 = (1 << 62) - 1;

pub const TAG_MASK: u64 = 0b1111;
pub const POINTER_MASK: u64 = 0b0111;
pub const POINTER_TAG: u64 = 0b0001;
pub const OLD_POINTER_TAG: u64 = 0b0001;
pub const YOUNG_POINTER_TAG: u64 = 0b1001;
pub const YOUNG_BIT: u64 = 0b1000;
pub const FLOAT_TAG: u64 = 0b0011;
pub const BOOL_TAG: u64 = 0b0101;
pub const SYMBOL_TAG: u64 = 0b0111;
pub const NULL_TAG: u64 = 0b1011;
pub const SMALL_STRING_TAG: u64 = 0b1101;
pub const SMALL_BYTES_TAG: u64 = 0b1111;

pub const BOOL_SHIFT: u32 = 8;
pub const SYMBOL_SHIFT: u32 = 32;
pub const ERROR_SHIFT: u32 = 4;
pub const ERROR_MASK: u64 = 0xF;
pub const SMALL_LENGTH_SHIFT: u32 = 4;
pub const SMALL_LENGTH_MASK: u64 = 0xF;
pub const SMALL_MAX_LENGTH: usize = 7;

pub const ADDRESS_MASK: u64 = !TAG_MASK;
pub const OBJECT_ALIGNMENT: u64 = 16;

#[inline]
pub const fn tag(raw: u64) -> u64 {
    raw & TAG_MASK
}

#[inline]
pub const fn is_int(raw: u64) -> bool {
    raw & INT_MASK == INT_TAG
}

#[inline]
pub const fn is_pointer_tag(raw: u64) -> bool {
    raw & POINTER_MASK == POINTER_TAG
}

#[inline]
pub const fn int_fits(value: i64) -> bool {
    value >= INT_MIN && value <= INT_MAX
}

#[inline]
pub const fn encode_int(value: i64) -> u64 {
    (value << INT_SHIFT) as u64
}

#[inline]
pub const fn decode_int(raw: u64) -> i64 {
    (raw as i64) >> INT_SHIFT
}

/// Keeps all but the 4 low mantissa bits. Subnormals round toward zero by
/// up to 15 units of `2^-1074`.
#[inline]
pub fn encode_float(value: f64) -> u64 {
    let bits = if value.is_nan() { f64::NAN.to_bits() } else { value.to_bits() };
    (bits & ADDRESS_MASK) | FLOAT_TAG
}

#[inline]
pub fn decode_float(raw: u64) -> f64 {
    f64::from_bits(raw & ADDRESS_MASK)
}

#[inline]
pub const fn encode_pointer(address: u64, young: bool) -> u64 {
    address | if young { YOUNG_POINTER_TAG } else { OLD_POINTER_TAG }
}

#[inline]
pub const fn decode_address(raw: u64) -> u64 {
    raw & ADDRESS_MASK
}

#[inline]
pub const fn encode_small(tag: u64, data: &[u8; 7], len: usize) -> u64 {
    let mut raw = tag | ((len as u64) << SMALL_LENGTH_SHIFT);
    let mut i = 0;
    while i < len {
        raw |= (data[i] as u64) << (8 * (i + 1));
        i += 1;
    }
    raw
}

#[inline]
pub const fn small_length(raw: u64) -> usize {
    ((raw >> SMALL_LENGTH_SHIFT) & SMALL_LENGTH_MASK) as usize
}

#[inline]
pub const fn small_data(raw: u64) -> [u8; 7] {
    let bytes = raw.to_le_bytes();
    [bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
}
