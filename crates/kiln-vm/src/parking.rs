//! Address-keyed wait queues.
//!
//! Waiters park on a key (normally the address of the state word they are
//! waiting on). The key hashes to one of a fixed number of buckets; each
//! bucket is a mutex-protected FIFO queue shared by every key that maps to
//! it.
//!
//! Parking takes a validation callback that runs under the bucket lock.
//! A waker must take the same lock to dequeue, so a state change that the
//! validation missed is always followed by a wakeup.
//!
//! A waiter is either an OS thread (blocks on its own condvar) or a fiber
//! (suspends back to its worker and is re-enqueued by the scheduler).

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHasher;

pub const DEFAULT_BUCKETS: usize = 256;

/// Something that can be woken after it was dequeued.
pub trait Unpark: Send + Sync {
    fn unpark(&self);
}

/// A blocking primitive usable by both fibers and threads.
pub trait Park {
    fn parking_lot(&self) -> &ParkingLot;

    /// Enqueue on `key` if `validate` holds under the bucket lock, then block
    /// until unparked. Returns false if validation failed.
    fn park(&self, key: usize, validate: &mut dyn FnMut() -> bool) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnparkResult {
    /// Token of the woken waiter.
    pub unparked: Option<u64>,
    /// More waiters remain on the same key.
    pub have_more: bool,
}

struct Parked {
    key: usize,
    token: u64,
    waiter: Arc<dyn Unpark>,
}

#[derive(Default)]
struct Bucket {
    queue: Mutex<VecDeque<Parked>>,
}

pub struct ParkingLot {
    buckets: Box<[Bucket]>,
}

impl ParkingLot {
    pub fn new(buckets: usize) -> Self {
        let buckets = buckets.max(1).next_power_of_two();
        Self { buckets: (0..buckets).map(|_| Bucket::default()).collect() }
    }

    fn bucket(&self, key: usize) -> &Bucket {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        &self.buckets[hasher.finish() as usize & (self.buckets.len() - 1)]
    }

    /// Append a waiter to the queue of `key` if `validate` returns true.
    pub fn enqueue(
        &self,
        key: usize,
        token: u64,
        waiter: Arc<dyn Unpark>,
        validate: &mut dyn FnMut() -> bool,
    ) -> bool {
        let mut queue = self.bucket(key).queue.lock();
        if !validate() {
            return false;
        }
        queue.push_back(Parked { key, token, waiter });
        log::trace!("parked token {} on {:#x}", token, key);
        true
    }

    /// Block the calling OS thread on `key`.
    pub fn park_thread(&self, key: usize, validate: &mut dyn FnMut() -> bool) -> bool {
        let parker = Arc::new(ThreadParker::default());
        let token = thread_token();
        if !self.enqueue(key, token, parker.clone(), validate) {
            return false;
        }
        parker.wait();
        true
    }

    /// Wake the oldest waiter on `key`. `callback` runs under the bucket
    /// lock before the waiter is woken.
    pub fn unpark_one(&self, key: usize, callback: impl FnOnce(UnparkResult)) -> UnparkResult {
        let mut queue = self.bucket(key).queue.lock();
        let woken = queue.iter().position(|p| p.key == key).and_then(|i| queue.remove(i));
        let result = UnparkResult {
            unparked: woken.as_ref().map(|p| p.token),
            have_more: queue.iter().any(|p| p.key == key),
        };
        callback(result);
        drop(queue);

        if let Some(parked) = woken {
            log::trace!("unparked token {} on {:#x}", parked.token, key);
            parked.waiter.unpark();
        }
        result
    }

    /// Wake every waiter on `key`, in arrival order. Returns how many were woken.
    pub fn unpark_all(&self, key: usize) -> usize {
        let woken: Vec<Parked> = {
            let mut queue = self.bucket(key).queue.lock();
            let (matching, rest): (VecDeque<Parked>, VecDeque<Parked>) =
                queue.drain(..).partition(|p| p.key == key);
            *queue = rest;
            matching.into()
        };
        for parked in &woken {
            parked.waiter.unpark();
        }
        woken.len()
    }

    /// Number of waiters currently queued on `key`.
    pub fn waiter_count(&self, key: usize) -> usize {
        self.bucket(key).queue.lock().iter().filter(|p| p.key == key).count()
    }
}

impl Default for ParkingLot {
    fn default() -> Self {
        Self::new(DEFAULT_BUCKETS)
    }
}

impl std::fmt::Debug for ParkingLot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParkingLot").field("buckets", &self.buckets.len()).finish()
    }
}

fn thread_token() -> u64 {
    let mut hasher = FxHasher::default();
    std::thread::current().id().hash(&mut hasher);
    hasher.finish()
}

// =============================================================================
// Thread parking
// =============================================================================

/// Wakeup flag plus condvar for one parked OS thread.
#[derive(Default)]
pub struct ThreadParker {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl ThreadParker {
    pub fn wait(&self) {
        let mut woken = self.woken.lock();
        while !*woken {
            self.condvar.wait(&mut woken);
        }
        *woken = false;
    }
}

impl Unpark for ThreadParker {
    fn unpark(&self) {
        *self.woken.lock() = true;
        self.condvar.notify_one();
    }
}

/// `Park` implementation for plain OS threads.
#[derive(Debug, Clone, Copy)]
pub struct ThreadPark<'a> {
    lot: &'a ParkingLot,
}

impl<'a> ThreadPark<'a> {
    pub fn new(lot: &'a ParkingLot) -> Self {
        Self { lot }
    }
}

impl Park for ThreadPark<'_> {
    fn parking_lot(&self) -> &ParkingLot {
        self.lot
    }

    fn park(&self, key: usize, validate: &mut dyn FnMut() -> bool) -> bool {
        self.lot.park_thread(key, validate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    struct Counter(AtomicUsize);

    impl Unpark for Counter {
        fn unpark(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_validation_failure_does_not_enqueue() {
        let lot = ParkingLot::new(4);
        let waiter = Arc::new(Counter(AtomicUsize::new(0)));
        assert!(!lot.enqueue(1, 0, waiter, &mut || false));
        assert_eq!(lot.waiter_count(1), 0);
    }

    #[test]
    fn test_unpark_one_is_fifo_and_reports_remaining() {
        let lot = ParkingLot::new(1);
        let waiter = Arc::new(Counter(AtomicUsize::new(0)));
        for token in 0..3 {
            assert!(lot.enqueue(8, token, waiter.clone(), &mut || true));
        }
        // a different key in the same bucket is left alone
        assert!(lot.enqueue(16, 99, waiter.clone(), &mut || true));

        let first = lot.unpark_one(8, |r| assert!(r.have_more));
        assert_eq!(first, UnparkResult { unparked: Some(0), have_more: true });
        assert_eq!(lot.unpark_one(8, |_| {}).unparked, Some(1));
        assert_eq!(lot.unpark_one(8, |_| {}), UnparkResult { unparked: Some(2), have_more: false });
        assert_eq!(lot.unpark_one(8, |_| {}).unparked, None);
        assert_eq!(waiter.0.load(Ordering::SeqCst), 3);
        assert_eq!(lot.waiter_count(16), 1);
        assert_eq!(lot.unpark_all(16), 1);
    }

    #[test]
    fn test_threads_are_woken() {
        let lot = Arc::new(ParkingLot::default());
        let key = 0x1000;
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lot = lot.clone();
                thread::spawn(move || lot.park_thread(key, &mut || true))
            })
            .collect();
        while lot.waiter_count(key) < 4 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(lot.unpark_all(key), 4);
        for handle in handles {
            assert!(handle.join().unwrap());
        }
    }
}
