//! Safepoint coordination.
//!
//! Every thread that may touch the heap registers as a mutator. A mutator
//! is `Working` while it may read or write heap objects, `Native` while it
//! has promised not to, and `Idle` while it has nothing to run.
//!
//! A collection starts with a single compare-and-swap of the global state
//! from `Working` to `GarbageCollection`. The winner then polls every other
//! mutator until each one is either `Idle`/`Native` or has parked itself in
//! `WaitingForGC` from its next checkpoint. Losers of the CAS park as well
//! and return once the winner calls `finish_gc`.
//!
//! Entering `Working` stores the new state before reading the global state,
//! so a mutator leaving `Idle` during a pause always observes it.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::parking::ParkingLot;

/// Log a warning after this many unsuccessful polls of one mutator.
const SLOW_SAFEPOINT_POLLS: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum GlobalState {
    Working = 0,
    GarbageCollection = 1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum MutatorState {
    Idle = 0,
    Working = 1,
    Native = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum GcState {
    None = 0,
    RequestGC = 1,
    WaitingForGC = 2,
    ExecutingGC = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutatorId(pub usize);

struct MutatorSlot {
    state: AtomicU8,
    gc_state: AtomicU8,
    lock: Mutex<()>,
    changed: Condvar,
}

impl MutatorSlot {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(MutatorState::Idle.into()),
            gc_state: AtomicU8::new(GcState::None.into()),
            lock: Mutex::new(()),
            changed: Condvar::new(),
        }
    }

    fn state(&self) -> MutatorState {
        MutatorState::try_from(self.state.load(Ordering::SeqCst)).unwrap_or(MutatorState::Working)
    }

    fn gc_state(&self) -> GcState {
        GcState::try_from(self.gc_state.load(Ordering::SeqCst)).unwrap_or(GcState::None)
    }

    fn set_state(&self, state: MutatorState) {
        let _guard = self.lock.lock();
        self.state.store(state.into(), Ordering::SeqCst);
        self.changed.notify_all();
    }

    fn set_gc_state(&self, state: GcState) {
        let _guard = self.lock.lock();
        self.gc_state.store(state.into(), Ordering::SeqCst);
        self.changed.notify_all();
    }

    fn is_safe(&self) -> bool {
        self.state() != MutatorState::Working || self.gc_state() == GcState::WaitingForGC
    }
}

pub struct Safepoint {
    state: AtomicU8,
    mutators: RwLock<Vec<Arc<MutatorSlot>>>,
    lot: Arc<ParkingLot>,
    poll_interval: Duration,
}

impl Safepoint {
    pub fn new(lot: Arc<ParkingLot>, poll_interval: Duration) -> Self {
        Self {
            state: AtomicU8::new(GlobalState::Working.into()),
            mutators: RwLock::new(Vec::new()),
            lot,
            poll_interval,
        }
    }

    /// Register a new mutator. It starts out `Idle`.
    pub fn register(&self) -> MutatorId {
        let mut mutators = self.mutators.write();
        mutators.push(Arc::new(MutatorSlot::new()));
        MutatorId(mutators.len() - 1)
    }

    pub fn mutator_count(&self) -> usize {
        self.mutators.read().len()
    }

    fn slot(&self, id: MutatorId) -> Arc<MutatorSlot> {
        self.mutators.read()[id.0].clone()
    }

    fn key(&self) -> usize {
        &self.state as *const AtomicU8 as usize
    }

    pub fn global_state(&self) -> GlobalState {
        GlobalState::try_from(self.state.load(Ordering::SeqCst)).unwrap_or(GlobalState::Working)
    }

    #[inline]
    pub fn is_gc_requested(&self) -> bool {
        self.state.load(Ordering::SeqCst) == u8::from(GlobalState::GarbageCollection)
    }

    /// Snapshot of every mutator's state, indexed by `MutatorId`.
    pub fn mutators(&self) -> Vec<(MutatorState, GcState)> {
        self.mutators
            .read()
            .iter()
            .map(|m| {
                let _guard = m.lock.lock();
                (m.state(), m.gc_state())
            })
            .collect()
    }

    // ---- mutator transitions ----

    /// Start touching the heap. Blocks while a collection is in progress.
    pub fn enter_working(&self, id: MutatorId) {
        let slot = self.slot(id);
        let paused = {
            let _guard = slot.lock.lock();
            slot.state.store(MutatorState::Working.into(), Ordering::SeqCst);
            let paused = self.is_gc_requested();
            if paused {
                slot.gc_state.store(GcState::WaitingForGC.into(), Ordering::SeqCst);
            }
            slot.changed.notify_all();
            paused
        };
        if paused {
            self.sync(id);
        }
    }

    pub fn enter_idle(&self, id: MutatorId) {
        self.slot(id).set_state(MutatorState::Idle);
    }

    pub fn enter_native(&self, id: MutatorId) {
        self.slot(id).set_state(MutatorState::Native);
    }

    pub fn exit_native(&self, id: MutatorId) {
        self.enter_working(id);
    }

    /// Observe a pending pause. Returns true if this mutator had to wait.
    pub fn checkpoint(&self, id: MutatorId) -> bool {
        if !self.is_gc_requested() {
            return false;
        }
        self.sync(id);
        true
    }

    /// Park until the current pause, if any, is over.
    pub fn sync(&self, id: MutatorId) {
        let slot = self.slot(id);
        slot.set_gc_state(GcState::WaitingForGC);
        loop {
            while self.is_gc_requested() {
                self.lot.park_thread(self.key(), &mut || self.is_gc_requested());
            }
            // a new pause may have started since the wakeup; leaving
            // `WaitingForGC` and checking must not interleave with a collector
            let _guard = slot.lock.lock();
            if !self.is_gc_requested() {
                slot.gc_state.store(GcState::None.into(), Ordering::SeqCst);
                slot.changed.notify_all();
                return;
            }
        }
    }

    // ---- collector side ----

    /// Try to become the collecting mutator.
    ///
    /// On success every other mutator is stopped when this returns, and the
    /// caller must call [`Safepoint::finish_gc`]. On failure another mutator
    /// collected while this one waited, and `false` is returned.
    pub fn request_gc(&self, id: MutatorId) -> bool {
        let slot = self.slot(id);
        slot.set_gc_state(GcState::RequestGC);
        let won = self
            .state
            .compare_exchange(
                GlobalState::Working.into(),
                GlobalState::GarbageCollection.into(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !won {
            slot.set_gc_state(GcState::None);
            self.sync(id);
            return false;
        }

        slot.set_gc_state(GcState::ExecutingGC);
        log::debug!("mutator {} requested a safepoint", id.0);
        self.wait_for_mutators(id);
        true
    }

    fn wait_for_mutators(&self, requester: MutatorId) {
        let mutators = self.mutators.read().clone();
        for (index, slot) in mutators.iter().enumerate() {
            if index == requester.0 {
                continue;
            }
            let mut guard = slot.lock.lock();
            let mut polls = 0u32;
            while !slot.is_safe() {
                if slot.changed.wait_for(&mut guard, self.poll_interval).timed_out() {
                    polls += 1;
                    if polls % SLOW_SAFEPOINT_POLLS == 0 {
                        log::warn!(
                            "mutator {} has not reached a safepoint after {:?}",
                            index,
                            self.poll_interval * polls
                        );
                    }
                }
            }
        }
        log::trace!("all mutators stopped for mutator {}", requester.0);
    }

    /// End the pause and release every parked mutator.
    pub fn finish_gc(&self, id: MutatorId) {
        debug_assert!(self.is_gc_requested());
        self.slot(id).set_gc_state(GcState::None);
        self.state.store(GlobalState::Working.into(), Ordering::SeqCst);
        let woken = self.lot.unpark_all(self.key());
        log::debug!("safepoint finished by mutator {}, {} mutators resumed", id.0, woken);
    }
}

impl std::fmt::Debug for Safepoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Safepoint")
            .field("state", &self.global_state())
            .field("mutators", &self.mutators())
            .finish()
    }
}
