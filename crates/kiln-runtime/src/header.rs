//! Object header.
//!
//! Layout (two 64-bit words, 16-byte aligned, directly before the payload):
//! ```text
//! word 0: [shape id: 24][survivor count: 8][lock: 8][flags: 8][count: 16]
//! word 1: [hashcode: 32][forward granule: 32]
//! ```
//!
//! `count` is the number of value fields for tuples and instances and the
//! byte length for data objects. The forward granule is the relocated
//! payload offset divided by 16, zero while the object has not moved.

use std::sync::atomic::{AtomicU64, Ordering};

use kiln_common_core::{Address, ShapeId};

pub const HEADER_SIZE: usize = 16;
pub const HEADER_WORDS: usize = 2;

const SHAPE_SHIFT: u32 = 0;
const SHAPE_MASK: u64 = 0xFF_FFFF;
const SURVIVOR_SHIFT: u32 = 24;
const LOCK_SHIFT: u32 = 32;
const FLAGS_SHIFT: u32 = 40;
const COUNT_SHIFT: u32 = 48;
const BYTE_MASK: u64 = 0xFF;
const COUNT_MASK: u64 = 0xFFFF;

const HASHCODE_MASK: u64 = 0xFFFF_FFFF;
const FORWARD_SHIFT: u32 = 32;

pub const MAX_SURVIVOR_COUNT: u8 = 15;
pub const MAX_COUNT: usize = COUNT_MASK as usize;

/// Header flag bits.
pub mod flags {
    pub const REACHABLE: u8 = 1;
    pub const HAS_HASHCODE: u8 = 2;
    pub const YOUNG_GENERATION: u8 = 4;
}

/// Borrowed view of an object's header words.
#[derive(Clone, Copy)]
pub struct ObjectHeader<'h> {
    word0: &'h AtomicU64,
    word1: &'h AtomicU64,
}

impl<'h> ObjectHeader<'h> {
    pub(crate) fn new(word0: &'h AtomicU64, word1: &'h AtomicU64) -> Self {
        Self { word0, word1 }
    }

    /// Zero both words and stamp a fresh allocation.
    pub fn initialize(&self, shape: ShapeId, count: usize, young: bool) {
        debug_assert!(shape <= ShapeId::MAX);
        debug_assert!(count <= MAX_COUNT);
        let flags = if young { flags::YOUNG_GENERATION } else { 0 };
        let word = ((shape.as_u32() as u64) << SHAPE_SHIFT)
            | ((flags as u64) << FLAGS_SHIFT)
            | ((count as u64) << COUNT_SHIFT);
        self.word1.store(0, Ordering::Relaxed);
        self.word0.store(word, Ordering::Release);
    }

    #[inline]
    pub fn raw_words(&self) -> (u64, u64) {
        (self.word0.load(Ordering::Acquire), self.word1.load(Ordering::Acquire))
    }

    // ---- word 0 ----

    #[inline]
    pub fn shape_id(&self) -> ShapeId {
        ShapeId::new(((self.word0.load(Ordering::Acquire) >> SHAPE_SHIFT) & SHAPE_MASK) as u32)
    }

    #[inline]
    pub fn survivor_count(&self) -> u8 {
        ((self.word0.load(Ordering::Acquire) >> SURVIVOR_SHIFT) & BYTE_MASK) as u8
    }

    #[inline]
    pub fn lock_byte(&self) -> u8 {
        ((self.word0.load(Ordering::Acquire) >> LOCK_SHIFT) & BYTE_MASK) as u8
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        ((self.word0.load(Ordering::Acquire) >> FLAGS_SHIFT) & BYTE_MASK) as u8
    }

    #[inline]
    pub fn count(&self) -> usize {
        ((self.word0.load(Ordering::Acquire) >> COUNT_SHIFT) & COUNT_MASK) as usize
    }

    #[inline]
    pub fn is_reachable(&self) -> bool {
        self.flags() & flags::REACHABLE != 0
    }

    #[inline]
    pub fn is_young(&self) -> bool {
        self.flags() & flags::YOUNG_GENERATION != 0
    }

    #[inline]
    pub fn has_cached_hashcode(&self) -> bool {
        self.flags() & flags::HAS_HASHCODE != 0
    }

    /// Replace one field of word 0 with a CAS loop that leaves the others intact.
    fn cas_field(&self, shift: u32, mask: u64, current: u64, new: u64) -> Result<u64, u64> {
        let mut word = self.word0.load(Ordering::Acquire);
        loop {
            let observed = (word >> shift) & mask;
            if observed != current {
                return Err(observed);
            }
            let updated = (word & !(mask << shift)) | ((new & mask) << shift);
            match self.word0.compare_exchange_weak(word, updated, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(current),
                Err(actual) => word = actual,
            }
        }
    }

    pub fn cas_shape_id(&self, current: ShapeId, new: ShapeId) -> bool {
        self.cas_field(SHAPE_SHIFT, SHAPE_MASK, current.as_u32() as u64, new.as_u32() as u64)
            .is_ok()
    }

    pub fn cas_survivor_count(&self, current: u8, new: u8) -> bool {
        debug_assert!(new <= MAX_SURVIVOR_COUNT);
        self.cas_field(SURVIVOR_SHIFT, BYTE_MASK, current as u64, new as u64).is_ok()
    }

    pub fn cas_count(&self, current: usize, new: usize) -> bool {
        debug_assert!(new <= MAX_COUNT);
        self.cas_field(COUNT_SHIFT, COUNT_MASK, current as u64, new as u64).is_ok()
    }

    pub fn cas_flags(&self, current: u8, new: u8) -> bool {
        self.cas_field(FLAGS_SHIFT, BYTE_MASK, current as u64, new as u64).is_ok()
    }

    /// Compare-and-swap on the lock byte. Returns the observed byte on failure.
    pub fn cas_lock_byte(&self, current: u8, new: u8) -> Result<u8, u8> {
        self.cas_field(LOCK_SHIFT, BYTE_MASK, current as u64, new as u64)
            .map(|v| v as u8)
            .map_err(|v| v as u8)
    }

    /// Set flag bits, retrying until the update lands.
    pub fn set_flags(&self, bits: u8) {
        let mut current = self.flags();
        while !self.cas_flags(current, current | bits) {
            current = self.flags();
        }
    }

    pub fn clear_flags(&self, bits: u8) {
        let mut current = self.flags();
        while !self.cas_flags(current, current & !bits) {
            current = self.flags();
        }
    }

    // ---- word 1 ----

    /// Cached hashcode, zero if not yet computed.
    #[inline]
    pub fn hashcode(&self) -> u32 {
        (self.word1.load(Ordering::Acquire) & HASHCODE_MASK) as u32
    }

    /// Publish a hashcode exactly once. Returns the hashcode that won.
    pub fn cas_hashcode(&self, hash: u32) -> u32 {
        debug_assert!(hash != 0);
        let mut word = self.word1.load(Ordering::Acquire);
        loop {
            let existing = (word & HASHCODE_MASK) as u32;
            if existing != 0 {
                return existing;
            }
            let updated = word | hash as u64;
            match self.word1.compare_exchange_weak(word, updated, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    self.set_flags(flags::HAS_HASHCODE);
                    return hash;
                }
                Err(actual) => word = actual,
            }
        }
    }

    #[inline]
    pub fn has_forward_target(&self) -> bool {
        self.word1.load(Ordering::Acquire) >> FORWARD_SHIFT != 0
    }

    pub fn forward_target(&self) -> Option<Address> {
        let granule = self.word1.load(Ordering::Acquire) >> FORWARD_SHIFT;
        (granule != 0).then(|| Address::new(granule * 16))
    }

    /// Record where the object was copied to. Only called by the collector.
    pub fn set_forward_target(&self, target: Address) {
        debug_assert!(!self.has_forward_target(), "object forwarded twice");
        let granule = target.as_u64() / 16;
        debug_assert!(granule <= u32::MAX as u64);
        let hash = self.word1.load(Ordering::Acquire) & HASHCODE_MASK;
        self.word1.store(hash | (granule << FORWARD_SHIFT), Ordering::Release);
    }

    /// Copy the header into a new location, dropping the forward target.
    pub(crate) fn copy_to(&self, target: &ObjectHeader<'_>, survivor_count: u8, young: bool) {
        let (word0, word1) = self.raw_words();
        let mut flags = ((word0 >> FLAGS_SHIFT) & BYTE_MASK) as u8;
        flags &= !(flags::REACHABLE | flags::YOUNG_GENERATION);
        if young {
            flags |= flags::YOUNG_GENERATION;
        }
        let word0 = (word0 & !((BYTE_MASK << FLAGS_SHIFT) | (BYTE_MASK << SURVIVOR_SHIFT)))
            | ((flags as u64) << FLAGS_SHIFT)
            | ((survivor_count.min(MAX_SURVIVOR_COUNT) as u64) << SURVIVOR_SHIFT);
        target.word1.store(word1 & HASHCODE_MASK, Ordering::Relaxed);
        target.word0.store(word0, Ordering::Release);
    }
}

impl std::fmt::Debug for ObjectHeader<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHeader")
            .field("shape", &self.shape_id())
            .field("count", &self.count())
            .field("flags", &self.flags())
            .field("survivor_count", &self.survivor_count())
            .field("hashcode", &self.hashcode())
            .field("forward", &self.forward_target())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words() -> [AtomicU64; 2] {
        [AtomicU64::new(u64::MAX), AtomicU64::new(u64::MAX)]
    }

    #[test]
    fn test_initialize_clears_everything() {
        let w = words();
        let header = ObjectHeader::new(&w[0], &w[1]);
        header.initialize(ShapeId::TUPLE, 3, true);
        assert_eq!(header.shape_id(), ShapeId::TUPLE);
        assert_eq!(header.count(), 3);
        assert_eq!(header.survivor_count(), 0);
        assert_eq!(header.lock_byte(), 0);
        assert_eq!(header.hashcode(), 0);
        assert!(header.is_young());
        assert!(!header.is_reachable());
        assert!(!header.has_forward_target());
    }

    #[test]
    fn test_fields_are_independent() {
        let w = words();
        let header = ObjectHeader::new(&w[0], &w[1]);
        header.initialize(ShapeId::FIRST_USER, 7, false);
        assert!(header.cas_count(7, 8));
        assert!(!header.cas_count(7, 9));
        assert!(header.cas_survivor_count(0, 2));
        assert_eq!(header.cas_lock_byte(0, 1), Ok(0));
        assert_eq!(header.cas_lock_byte(0, 1), Err(1));
        header.set_flags(flags::REACHABLE);
        assert_eq!(header.shape_id(), ShapeId::FIRST_USER);
        assert_eq!(header.count(), 8);
        assert_eq!(header.survivor_count(), 2);
        assert_eq!(header.lock_byte(), 1);
        assert!(header.is_reachable());
        header.clear_flags(flags::REACHABLE);
        assert!(!header.is_reachable());
    }

    #[test]
    fn test_hashcode_is_published_once() {
        let w = words();
        let header = ObjectHeader::new(&w[0], &w[1]);
        header.initialize(ShapeId::INSTANCE, 0, false);
        assert_eq!(header.cas_hashcode(42), 42);
        assert_eq!(header.cas_hashcode(7), 42);
        assert!(header.has_cached_hashcode());
    }

    #[test]
    fn test_forward_target_keeps_hashcode() {
        let w = words();
        let header = ObjectHeader::new(&w[0], &w[1]);
        header.initialize(ShapeId::TUPLE, 1, true);
        header.cas_hashcode(99);
        header.set_forward_target(Address::new(0x1230));
        assert_eq!(header.forward_target(), Some(Address::new(0x1230)));
        assert_eq!(header.hashcode(), 99);
    }
}
