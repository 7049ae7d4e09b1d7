//! Region-based heap arena.
//!
//! The heap is one contiguous array of 64-bit words split into fixed-size
//! regions. Objects never straddle a region boundary. Addresses are byte
//! offsets into the arena, so relocation only rewrites offsets.
//!
//! Young objects are bump-allocated from per-mutator allocation buffers
//! that each own one eden region at a time. Old objects (promoted by the
//! collector, or allocated directly because they are pinned) share a single
//! bump cursor guarded by the region table lock.
//!
//! Mutators may not take the last free regions: enough stay free to
//! evacuate every young region, so a collection started on `Exhausted`
//! always has a to-space. Only the collector allocates from that reserve.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use kiln_common_core::{Address, ShapeId, Value};
use parking_lot::Mutex;
use rustc_hash::FxHasher;

use crate::error::HeapError;
use crate::header::{ObjectHeader, HEADER_SIZE};

pub const OBJECT_ALIGNMENT: usize = 16;
pub const MIN_REGION_SIZE: usize = 4096;
/// Every object in a region must be describable by a 16-bit header count.
pub const MAX_REGION_SIZE: usize = 512 * 1024;
/// Smallest heap that leaves room for eden after the evacuation reserve.
pub const MIN_REGIONS: usize = 8;

/// Forward targets are stored as 32-bit granule indices.
pub const MAX_HEAP_SIZE: usize = (u32::MAX as usize) * OBJECT_ALIGNMENT;

#[inline]
pub const fn align_up(size: usize) -> usize {
    (size + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

/// Payload bytes of an object with the given shape and count.
#[inline]
pub const fn payload_size(shape: ShapeId, count: usize) -> usize {
    if shape.is_data() {
        align_up(count)
    } else {
        align_up(count * 8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Free,
    Eden,
    Survivor,
    Old,
}

impl RegionKind {
    pub fn is_young(self) -> bool {
        matches!(self, RegionKind::Eden | RegionKind::Survivor)
    }
}

#[derive(Debug, Clone)]
pub struct HeapConfig {
    pub heap_size: usize,
    pub region_size: usize,
    /// Number of independent allocation buffers (one per mutator).
    pub allocation_buffers: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            heap_size: 32 * 1024 * 1024,
            region_size: 256 * 1024,
            allocation_buffers: 1,
        }
    }
}

// =============================================================================
// Region table
// =============================================================================

#[derive(Debug, Clone, Copy)]
pub(crate) struct Region {
    pub kind: RegionKind,
    /// Bytes in use, counted from the region start.
    pub top: usize,
}

/// Free regions the collector needs to evacuate `young` regions.
///
/// Copying packs objects next-fit into two streams (survivor and old), and
/// next-fit fills any two consecutive regions past one region's worth, so
/// twice the young regions plus one partial region per stream always fits.
#[inline]
pub const fn evacuation_reserve(young: usize) -> usize {
    2 * young + 2
}

#[derive(Debug)]
pub(crate) struct RegionTable {
    pub regions: Vec<Region>,
    pub free: Vec<usize>,
    pub old_cursor: Option<usize>,
    /// Regions that are `Eden` or `Survivor`.
    pub young: usize,
}

impl RegionTable {
    fn new(count: usize) -> Self {
        Self {
            regions: vec![Region { kind: RegionKind::Free, top: 0 }; count],
            // pop from the back hands out low regions first
            free: (0..count).rev().collect(),
            old_cursor: None,
            young: 0,
        }
    }

    /// Take a free region. Used directly by the collector.
    pub fn acquire(&mut self, kind: RegionKind) -> Option<usize> {
        let index = self.free.pop()?;
        self.regions[index] = Region { kind, top: 0 };
        if kind.is_young() {
            self.young += 1;
        }
        Some(index)
    }

    /// Take a free region for a mutator, leaving the evacuation reserve.
    pub fn acquire_for_mutator(&mut self, kind: RegionKind) -> Option<usize> {
        let young_after = self.young + usize::from(kind.is_young());
        if self.free.len() < evacuation_reserve(young_after) + 1 {
            return None;
        }
        self.acquire(kind)
    }

    pub fn release(&mut self, index: usize) {
        let kind = self.regions[index].kind;
        debug_assert!(kind != RegionKind::Free);
        if kind.is_young() {
            self.young -= 1;
        }
        self.regions[index] = Region { kind: RegionKind::Free, top: 0 };
        if self.old_cursor == Some(index) {
            self.old_cursor = None;
        }
        self.free.push(index);
    }

    /// Bump-allocate `total` bytes from the shared cursor of `kind`.
    /// A mutator may only open a new region outside the evacuation reserve.
    pub fn bump(
        &mut self,
        cursor: &mut Option<usize>,
        kind: RegionKind,
        total: usize,
        region_size: usize,
        mutator: bool,
    ) -> Option<usize> {
        if let Some(index) = *cursor {
            let region = &mut self.regions[index];
            if region.top + total <= region_size {
                let offset = index * region_size + region.top;
                region.top += total;
                return Some(offset);
            }
        }
        let index = if mutator { self.acquire_for_mutator(kind)? } else { self.acquire(kind)? };
        *cursor = Some(index);
        self.regions[index].top = total;
        Some(index * region_size)
    }

    pub fn bump_old(&mut self, total: usize, region_size: usize, mutator: bool) -> Option<usize> {
        let mut cursor = self.old_cursor;
        let result = self.bump(&mut cursor, RegionKind::Old, total, region_size, mutator);
        self.old_cursor = cursor;
        result
    }
}

// =============================================================================
// Allocation buffers
// =============================================================================

#[derive(Debug, Default)]
pub(crate) struct AllocationBuffer {
    pub region: Option<usize>,
    pub cursor: usize,
    pub end: usize,
}

impl AllocationBuffer {
    fn try_bump(&mut self, total: usize) -> Option<usize> {
        self.region?;
        if self.cursor + total > self.end {
            return None;
        }
        let offset = self.cursor;
        self.cursor += total;
        Some(offset)
    }

    /// Publish the fill level of the current region and detach from it.
    fn retire(&mut self, table: &mut RegionTable, region_size: usize) {
        if let Some(index) = self.region.take() {
            table.regions[index].top = self.cursor - index * region_size;
        }
        self.cursor = 0;
        self.end = 0;
    }
}

// =============================================================================
// Heap
// =============================================================================

pub struct Heap {
    words: Box<[AtomicU64]>,
    region_size: usize,
    pub(crate) table: Mutex<RegionTable>,
    pub(crate) buffers: Box<[Mutex<AllocationBuffer>]>,
    next_hashcode: AtomicU32,
}

impl Heap {
    pub fn new(config: &HeapConfig) -> Result<Self, HeapError> {
        if config.region_size < MIN_REGION_SIZE
            || config.region_size > MAX_REGION_SIZE
            || !config.region_size.is_power_of_two()
        {
            return Err(HeapError::InvalidConfig("region size must be a power of two between 4 KiB and 512 KiB"));
        }
        if config.heap_size > MAX_HEAP_SIZE {
            return Err(HeapError::InvalidConfig("heap size exceeds the addressable range"));
        }
        let region_count = config.heap_size / config.region_size;
        if region_count < MIN_REGIONS {
            return Err(HeapError::InvalidConfig("heap must hold at least eight regions"));
        }
        if config.allocation_buffers == 0 {
            return Err(HeapError::InvalidConfig("at least one allocation buffer is required"));
        }

        let word_count = region_count * config.region_size / 8;
        let words: Box<[AtomicU64]> = (0..word_count).map(|_| AtomicU64::new(0)).collect();
        let buffers = (0..config.allocation_buffers)
            .map(|_| Mutex::new(AllocationBuffer::default()))
            .collect();

        log::debug!(
            "heap initialized: {} regions of {} bytes, {} allocation buffers",
            region_count,
            config.region_size,
            config.allocation_buffers
        );

        Ok(Self {
            words,
            region_size: config.region_size,
            table: Mutex::new(RegionTable::new(region_count)),
            buffers,
            next_hashcode: AtomicU32::new(1),
        })
    }

    #[inline]
    pub fn region_size(&self) -> usize {
        self.region_size
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len() * 8
    }

    pub fn region_count(&self) -> usize {
        self.table.lock().regions.len()
    }

    pub fn free_region_count(&self) -> usize {
        self.table.lock().free.len()
    }

    /// Share of regions in use, between 0 and 1.
    pub fn utilization(&self) -> f32 {
        let table = self.table.lock();
        1.0 - table.free.len() as f32 / table.regions.len() as f32
    }

    /// Number of regions currently holding objects of `kind`.
    pub fn regions_of(&self, kind: RegionKind) -> usize {
        self.table.lock().regions.iter().filter(|r| r.kind == kind).count()
    }

    /// Allocate `size` zeroed payload bytes. The header is stamped with a
    /// placeholder shape until the caller calls [`Heap::initialize_header`].
    ///
    /// Pinned objects are placed in the old generation and never move.
    pub fn allocate(&self, buffer: usize, size: usize, pinned: bool) -> Result<Address, HeapError> {
        let total = HEADER_SIZE + align_up(size);
        if total > self.region_size {
            return Err(HeapError::TooLarge { requested: size, region_size: self.region_size });
        }

        let (header_offset, young) = if pinned {
            let offset = self
                .table
                .lock()
                .bump_old(total, self.region_size, true)
                .ok_or(HeapError::Exhausted { requested: size })?;
            (offset, false)
        } else {
            (self.allocate_young(buffer, total, size)?, true)
        };

        let address = Address::new((header_offset + HEADER_SIZE) as u64);
        let fields = align_up(size) / 8;
        for i in 0..fields {
            self.word(address, i).store(0, Ordering::Relaxed);
        }
        // until initialized the object reads as a tuple of zero ints
        self.header(address).initialize(ShapeId::TUPLE, fields, young);
        Ok(address)
    }

    fn allocate_young(&self, buffer: usize, total: usize, size: usize) -> Result<usize, HeapError> {
        debug_assert!(buffer < self.buffers.len());
        let mut tab = self.buffers[buffer % self.buffers.len()].lock();
        if let Some(offset) = tab.try_bump(total) {
            return Ok(offset);
        }

        let mut table = self.table.lock();
        tab.retire(&mut table, self.region_size);
        let index = table
            .acquire_for_mutator(RegionKind::Eden)
            .ok_or(HeapError::Exhausted { requested: size })?;
        drop(table);

        tab.region = Some(index);
        tab.cursor = index * self.region_size;
        tab.end = tab.cursor + self.region_size;
        tab.try_bump(total).ok_or(HeapError::Exhausted { requested: size })
    }

    /// Detach every allocation buffer from its region.
    pub(crate) fn retire_buffers(&self) {
        for buffer in self.buffers.iter() {
            let mut buffer = buffer.lock();
            buffer.retire(&mut self.table.lock(), self.region_size);
        }
    }

    /// Stamp the real shape and count on a fresh allocation.
    pub fn initialize_header(&self, address: Address, shape: ShapeId, count: usize) {
        let header = self.header(address);
        let young = header.is_young();
        header.initialize(shape, count, young);
    }

    #[inline]
    pub fn header(&self, address: Address) -> ObjectHeader<'_> {
        let index = address.as_usize() / 8 - 2;
        ObjectHeader::new(&self.words[index], &self.words[index + 1])
    }

    /// Pointer value for `address`, tagged with its current generation.
    #[inline]
    pub fn pointer(&self, address: Address) -> Value {
        Value::pointer(address, self.header(address).is_young())
    }

    #[inline]
    pub fn shape_of(&self, value: Value) -> ShapeId {
        match value.shape_id() {
            Some(shape) => shape,
            None => self.header(value.as_address()).shape_id(),
        }
    }

    /// Total bytes occupied by the object, header included.
    pub fn object_size(&self, address: Address) -> usize {
        let header = self.header(address);
        HEADER_SIZE + payload_size(header.shape_id(), header.count())
    }

    pub fn region_index(&self, address: Address) -> usize {
        (address.as_usize() - HEADER_SIZE) / self.region_size
    }

    pub fn region_kind(&self, address: Address) -> RegionKind {
        let index = self.region_index(address);
        self.table.lock().regions[index].kind
    }

    // ---- payload access ----

    #[inline]
    fn word(&self, address: Address, index: usize) -> &AtomicU64 {
        &self.words[address.as_usize() / 8 + index]
    }

    /// Load the value field at `index`.
    #[inline]
    pub fn load(&self, address: Address, index: usize) -> Value {
        Value::from_raw(self.word(address, index).load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, address: Address, index: usize, value: Value) {
        self.word(address, index).store(value.raw(), Ordering::Release);
    }

    pub fn read_bytes(&self, address: Address, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        for i in 0..len.div_ceil(8) {
            let word = self.word(address, i).load(Ordering::Acquire).to_le_bytes();
            let take = (len - i * 8).min(8);
            out.extend_from_slice(&word[..take]);
        }
        out
    }

    pub fn write_bytes(&self, address: Address, data: &[u8]) {
        for (i, chunk) in data.chunks(8).enumerate() {
            let mut word = [0u8; 8];
            word[..chunk.len()].copy_from_slice(chunk);
            self.word(address, i).store(u64::from_le_bytes(word), Ordering::Release);
        }
    }

    /// Copy `total` bytes (header included) between two header offsets.
    pub(crate) fn copy_words(&self, from: Address, to: Address, total: usize) {
        let src = from.as_usize() / 8 - 2;
        let dst = to.as_usize() / 8 - 2;
        for i in 0..total / 8 {
            let word = self.words[src + i].load(Ordering::Relaxed);
            self.words[dst + i].store(word, Ordering::Relaxed);
        }
    }

    // ---- hashing ----

    /// Lazily computed identity hash. Stable across relocation.
    pub fn hashcode(&self, address: Address) -> u32 {
        use std::hash::Hasher;

        let header = self.header(address);
        let cached = header.hashcode();
        if cached != 0 {
            return cached;
        }
        let shape = header.shape_id();
        let hash = if shape.is_data() {
            let mut hasher = FxHasher::default();
            hasher.write(&self.read_bytes(address, header.count()));
            hasher.finish() as u32
        } else {
            self.next_hashcode.fetch_add(1, Ordering::Relaxed)
        };
        header.cas_hashcode(hash.max(1))
    }

    /// Walk every object in `region`, in allocation order.
    pub(crate) fn objects_in(&self, region: usize, top: usize) -> Vec<Address> {
        let mut objects = Vec::new();
        let start = region * self.region_size;
        let mut offset = 0;
        while offset < top {
            let address = Address::new((start + offset + HEADER_SIZE) as u64);
            offset += self.object_size(address);
            objects.push(address);
        }
        objects
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("capacity", &self.capacity())
            .field("region_size", &self.region_size)
            .field("free_regions", &self.free_region_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap(regions: usize) -> Heap {
        Heap::new(&HeapConfig {
            heap_size: regions * MIN_REGION_SIZE,
            region_size: MIN_REGION_SIZE,
            allocation_buffers: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_bad_config() {
        let config = HeapConfig { heap_size: 4 * 4096, region_size: 4096, allocation_buffers: 1 };
        assert!(matches!(Heap::new(&config), Err(HeapError::InvalidConfig(_))));
        let config = HeapConfig { heap_size: 1 << 20, region_size: 5000, allocation_buffers: 1 };
        assert!(Heap::new(&config).is_err());
    }

    #[test]
    fn test_addresses_are_aligned_and_nonzero() {
        let heap = small_heap(8);
        let a = heap.allocate(0, 3, false).unwrap();
        let b = heap.allocate(0, 24, false).unwrap();
        assert_eq!(a.as_u64(), 16);
        assert_eq!(b.as_u64() % 16, 0);
        assert_eq!(b.as_u64(), 16 + 16 + 16);
        assert!(heap.header(a).is_young());
        assert_eq!(heap.region_kind(a), RegionKind::Eden);
    }

    #[test]
    fn test_buffers_use_separate_regions() {
        let heap = small_heap(8);
        let a = heap.allocate(0, 8, false).unwrap();
        let b = heap.allocate(1, 8, false).unwrap();
        assert_ne!(heap.region_index(a), heap.region_index(b));
        assert_eq!(heap.free_region_count(), 6);
    }

    #[test]
    fn test_pinned_objects_are_old() {
        let heap = small_heap(8);
        let a = heap.allocate(0, 32, true).unwrap();
        assert!(!heap.header(a).is_young());
        assert_eq!(heap.region_kind(a), RegionKind::Old);
        assert!(heap.pointer(a).is_old_pointer());
    }

    #[test]
    fn test_exhaustion_and_too_large() {
        let heap = small_heap(8);
        assert!(matches!(heap.allocate(0, MIN_REGION_SIZE, false), Err(HeapError::TooLarge { .. })));
        let chunk = MIN_REGION_SIZE - HEADER_SIZE;
        heap.allocate(0, chunk, false).unwrap();
        heap.allocate(0, chunk, false).unwrap();
        assert_eq!(heap.allocate(0, 16, false), Err(HeapError::Exhausted { requested: 16 }));
        // the rest is held back for evacuation
        assert_eq!(heap.free_region_count(), evacuation_reserve(2));
    }

    #[test]
    fn test_mutators_leave_the_evacuation_reserve() {
        let heap = small_heap(16);
        let chunk = MIN_REGION_SIZE - HEADER_SIZE;
        let mut young = 0;
        while heap.allocate(0, chunk, false).is_ok() {
            young += 1;
        }
        assert_eq!(young, 4);
        assert_eq!(heap.free_region_count(), 12);

        let mut pinned = 0;
        while heap.allocate(0, chunk, true).is_ok() {
            pinned += 1;
        }
        assert_eq!(pinned, 2);
        assert_eq!(heap.free_region_count(), evacuation_reserve(young));
        assert_eq!(heap.utilization(), 6.0 / 16.0);
    }

    #[test]
    fn test_bytes_round_trip() {
        let heap = small_heap(8);
        let a = heap.allocate(0, 11, false).unwrap();
        heap.write_bytes(a, b"hello world");
        assert_eq!(heap.read_bytes(a, 11), b"hello world");
    }

    #[test]
    fn test_hashcode_is_stable() {
        let heap = small_heap(8);
        let a = heap.allocate(0, 8, false).unwrap();
        heap.initialize_header(a, ShapeId::TUPLE, 1);
        let h = heap.hashcode(a);
        assert_ne!(h, 0);
        assert_eq!(heap.hashcode(a), h);
    }
}
