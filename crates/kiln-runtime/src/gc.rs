//! Generational copying collector.
//!
//! Runs only while every mutator is stopped at a safepoint. One collection:
//! 1. Evacuate roots: young objects are copied into survivor regions (or
//!    promoted into old regions once they reach the promotion threshold);
//!    old objects are marked reachable in place.
//! 2. Drain the gray stack, evacuating every value field of the copied or
//!    marked objects. Data objects are not scanned.
//! 3. Release all regions that were young before the collection.
//! 4. Sweep old regions: a region without a reachable object is released,
//!    marks are cleared in the others.

use kiln_common_core::{Address, Value};

use crate::error::HeapError;
use crate::header::{flags, MAX_SURVIVOR_COUNT};
use crate::heap::{Heap, RegionKind, RegionTable};

/// Source of the precise root set.
///
/// Implementations call `visitor` once per root slot and store the value it
/// returns back into that slot.
pub trait RootSet {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Value) -> Value);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: u64,
    pub objects_copied: u64,
    pub bytes_copied: u64,
    pub objects_promoted: u64,
    pub objects_marked: u64,
    pub regions_freed: u64,
}

impl GcStats {
    pub fn merge(&mut self, other: &GcStats) {
        self.collections += other.collections;
        self.objects_copied += other.objects_copied;
        self.bytes_copied += other.bytes_copied;
        self.objects_promoted += other.objects_promoted;
        self.objects_marked += other.objects_marked;
        self.regions_freed += other.regions_freed;
    }
}

/// Collect the whole heap. The caller must guarantee no mutator is running.
pub fn collect(heap: &Heap, roots: &dyn RootSet, promotion_threshold: u8) -> Result<GcStats, HeapError> {
    heap.retire_buffers();
    let mut table = heap.table.lock();
    let from_space: Vec<bool> = table.regions.iter().map(|r| r.kind.is_young()).collect();

    let mut stats = GcStats { collections: 1, ..GcStats::default() };
    {
        let mut evacuator = Evacuator {
            heap,
            table: &mut table,
            from_space: &from_space,
            survivor_cursor: None,
            threshold: promotion_threshold.clamp(1, MAX_SURVIVOR_COUNT),
            gray: Vec::new(),
            stats: &mut stats,
            error: None,
        };
        roots.visit_roots(&mut |value| evacuator.evacuate(value));
        evacuator.drain();
        if let Some(error) = evacuator.error {
            log::error!("collection failed: {}", error);
            return Err(error);
        }
    }

    for (index, young) in from_space.iter().enumerate() {
        if *young {
            table.release(index);
            stats.regions_freed += 1;
        }
    }
    sweep_old(heap, &mut table, &mut stats);

    log::debug!(
        "gc: copied {} objects ({} bytes), promoted {}, marked {}, freed {} regions, {} free",
        stats.objects_copied,
        stats.bytes_copied,
        stats.objects_promoted,
        stats.objects_marked,
        stats.regions_freed,
        table.free.len()
    );
    Ok(stats)
}

struct Evacuator<'a> {
    heap: &'a Heap,
    table: &'a mut RegionTable,
    from_space: &'a [bool],
    survivor_cursor: Option<usize>,
    threshold: u8,
    gray: Vec<Address>,
    stats: &'a mut GcStats,
    error: Option<HeapError>,
}

impl Evacuator<'_> {
    fn evacuate(&mut self, value: Value) -> Value {
        if !value.is_pointer() || self.error.is_some() {
            return value;
        }
        let heap = self.heap;
        let address = value.as_address();
        let region = heap.region_index(address);

        if self.from_space[region] {
            return self.copy(address);
        }
        match self.table.regions[region].kind {
            RegionKind::Old => {
                let header = heap.header(address);
                if !header.is_reachable() {
                    header.set_flags(flags::REACHABLE);
                    self.stats.objects_marked += 1;
                    self.gray.push(address);
                }
                Value::pointer(address, false)
            }
            // already in to-space
            _ => value,
        }
    }

    fn copy(&mut self, address: Address) -> Value {
        let heap = self.heap;
        let header = heap.header(address);
        if let Some(target) = header.forward_target() {
            return heap.pointer(target);
        }

        let total = heap.object_size(address);
        let survived = header.survivor_count().saturating_add(1);
        let region_size = heap.region_size();

        let survivor = if survived < self.threshold {
            self.table.bump(&mut self.survivor_cursor, RegionKind::Survivor, total, region_size, false)
        } else {
            None
        };
        let (offset, young) = match survivor {
            Some(offset) => (offset, true),
            None => match self.table.bump_old(total, region_size, false) {
                Some(offset) => (offset, false),
                None => {
                    self.error = Some(HeapError::Exhausted { requested: total });
                    return heap.pointer(address);
                }
            },
        };

        let target = Address::new((offset + crate::header::HEADER_SIZE) as u64);
        heap.copy_words(address, target, total);
        let copied = heap.header(target);
        header.copy_to(&copied, survived, young);
        if !young {
            copied.set_flags(flags::REACHABLE);
            self.stats.objects_promoted += 1;
        }
        header.set_forward_target(target);

        self.stats.objects_copied += 1;
        self.stats.bytes_copied += total as u64;
        self.gray.push(target);
        Value::pointer(target, young)
    }

    fn drain(&mut self) {
        while let Some(address) = self.gray.pop() {
            let header = self.heap.header(address);
            if !header.shape_id().has_value_fields() {
                continue;
            }
            for index in 0..header.count() {
                let field = self.heap.load(address, index);
                if field.is_pointer() {
                    let updated = self.evacuate(field);
                    if updated != field {
                        self.heap.store(address, index, updated);
                    }
                }
            }
        }
    }
}

fn sweep_old(heap: &Heap, table: &mut RegionTable, stats: &mut GcStats) {
    for index in 0..table.regions.len() {
        let region = table.regions[index];
        if region.kind != RegionKind::Old {
            continue;
        }
        let mut live = false;
        for address in heap.objects_in(index, region.top) {
            let header = heap.header(address);
            if header.is_reachable() {
                live = true;
                header.clear_flags(flags::REACHABLE);
            }
        }
        if !live {
            table.release(index);
            stats.regions_freed += 1;
        }
    }
}
