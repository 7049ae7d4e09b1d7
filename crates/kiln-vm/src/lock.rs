//! Small locks built on the parking lot.
//!
//! The lock state is one byte: `LOCKED` while held, `PARKED` while at least
//! one waiter may be queued. Unlocking a contended lock hands the lock back
//! to the pool rather than directly to a waiter, so a running fiber may
//! barge ahead of a woken one.
//!
//! The same algorithm runs over a standalone `AtomicU8` (`TinyLock`,
//! `FiberMutex`) and over the lock byte of an object header.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};

use kiln_runtime::{Heap, ObjectHeader, Value};

use crate::parking::{Park, ParkingLot};

pub const LOCKED: u8 = 1;
pub const PARKED: u8 = 2;

const SPIN_LIMIT: u32 = 40;

/// Keys for header locks live above any real address.
const OBJECT_KEY_BIT: usize = 1 << (usize::BITS - 1);

trait LockWord {
    fn load(&self) -> u8;
    fn compare_exchange(&self, current: u8, new: u8) -> Result<u8, u8>;
    fn key(&self) -> usize;

    fn store(&self, value: u8) {
        let mut current = self.load();
        while let Err(actual) = self.compare_exchange(current, value) {
            current = actual;
        }
    }
}

fn lock_slow(word: &dyn LockWord, parker: &dyn Park) {
    let mut spins = 0;
    loop {
        let state = word.load();
        if state & LOCKED == 0 {
            if word.compare_exchange(state, state | LOCKED).is_ok() {
                return;
            }
            continue;
        }
        if state & PARKED == 0 {
            if spins < SPIN_LIMIT {
                spins += 1;
                std::hint::spin_loop();
                continue;
            }
            if word.compare_exchange(state, state | PARKED).is_err() {
                continue;
            }
        }
        parker.park(word.key(), &mut || word.load() == LOCKED | PARKED);
    }
}

// =============================================================================
// TinyLock
// =============================================================================

#[derive(Debug, Default)]
pub struct TinyLock {
    state: AtomicU8,
}

impl LockWord for TinyLock {
    fn load(&self) -> u8 {
        self.state.load(Ordering::Acquire)
    }

    fn compare_exchange(&self, current: u8, new: u8) -> Result<u8, u8> {
        self.state.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }

    fn key(&self) -> usize {
        &self.state as *const AtomicU8 as usize
    }

    fn store(&self, value: u8) {
        self.state.store(value, Ordering::Release);
    }
}

impl TinyLock {
    pub const fn new() -> Self {
        Self { state: AtomicU8::new(0) }
    }

    pub fn is_locked(&self) -> bool {
        LockWord::load(self) & LOCKED != 0
    }

    pub fn try_lock(&self) -> bool {
        let state = LockWord::load(self);
        state & LOCKED == 0 && LockWord::compare_exchange(self, state, state | LOCKED).is_ok()
    }

    pub fn lock(&self, parker: &dyn Park) {
        if LockWord::compare_exchange(self, 0, LOCKED).is_ok() {
            return;
        }
        lock_slow(self, parker);
    }

    pub fn unlock(&self, lot: &ParkingLot) {
        if LockWord::compare_exchange(self, LOCKED, 0).is_ok() {
            return;
        }
        lot.unpark_one(self.key(), |result| {
            LockWord::store(self, if result.have_more { PARKED } else { 0 });
        });
    }
}

// =============================================================================
// FiberMutex
// =============================================================================

/// Mutex whose waiters park instead of blocking their worker thread.
pub struct FiberMutex<T> {
    lock: TinyLock,
    value: UnsafeCell<T>,
}

// SAFETY: access to `value` is serialized by `lock`.
unsafe impl<T: Send> Send for FiberMutex<T> {}
unsafe impl<T: Send> Sync for FiberMutex<T> {}

impl<T> FiberMutex<T> {
    pub fn new(value: T) -> Self {
        Self { lock: TinyLock::new(), value: UnsafeCell::new(value) }
    }

    pub fn lock<'a>(&'a self, parker: &'a dyn Park) -> FiberMutexGuard<'a, T> {
        self.lock.lock(parker);
        FiberMutexGuard { mutex: self, lot: parker.parking_lot() }
    }

    pub fn try_lock<'a>(&'a self, lot: &'a ParkingLot) -> Option<FiberMutexGuard<'a, T>> {
        self.lock.try_lock().then(|| FiberMutexGuard { mutex: self, lot })
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for FiberMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberMutex").field("locked", &self.is_locked()).finish_non_exhaustive()
    }
}

pub struct FiberMutexGuard<'a, T> {
    mutex: &'a FiberMutex<T>,
    lot: &'a ParkingLot,
}

impl<T> Deref for FiberMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard holds the lock.
        unsafe { &*self.mutex.value.get() }
    }
}

impl<T> DerefMut for FiberMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard holds the lock.
        unsafe { &mut *self.mutex.value.get() }
    }
}

impl<T> Drop for FiberMutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.lock.unlock(self.lot);
    }
}

// =============================================================================
// Object header locks
// =============================================================================

struct HeaderLock<'h> {
    header: ObjectHeader<'h>,
    key: usize,
}

impl<'h> HeaderLock<'h> {
    fn new(heap: &'h Heap, object: Value) -> Self {
        let address = object.as_address();
        // the hashcode survives relocation, the address does not
        let key = OBJECT_KEY_BIT | heap.hashcode(address) as usize;
        Self { header: heap.header(address), key }
    }
}

impl LockWord for HeaderLock<'_> {
    fn load(&self) -> u8 {
        self.header.lock_byte()
    }

    fn compare_exchange(&self, current: u8, new: u8) -> Result<u8, u8> {
        self.header.cas_lock_byte(current, new)
    }

    fn key(&self) -> usize {
        self.key
    }
}

/// Acquire the per-object lock in the header of `object`.
pub fn lock_object(heap: &Heap, object: Value, parker: &dyn Park) {
    let lock = HeaderLock::new(heap, object);
    if lock.compare_exchange(0, LOCKED).is_ok() {
        return;
    }
    lock_slow(&lock, parker);
}

/// Release the per-object lock. `object` must be the current location of
/// the object, which may differ from the one passed to `lock_object`.
pub fn unlock_object(heap: &Heap, object: Value, lot: &ParkingLot) {
    let lock = HeaderLock::new(heap, object);
    if lock.compare_exchange(LOCKED, 0).is_ok() {
        return;
    }
    // hashcode keys may collide, so every waiter re-checks its own object
    lock.store(0);
    lot.unpark_all(lock.key());
}

pub fn is_object_locked(heap: &Heap, object: Value) -> bool {
    heap.header(object.as_address()).lock_byte() & LOCKED != 0
}
