//! M:N fiber scheduling.
//!
//! Each worker owns a FIFO deque; new, yielded and woken-by-others fibers go
//! through a shared injector. A worker looks in its own deque first, then
//! takes a batch from the injector, then steals from its peers.

mod worker;

use std::sync::Arc;
use std::time::Duration;

use crossbeam_deque::{Injector, Steal, Stealer, Worker as LocalQueue};
use parking_lot::{Condvar, Mutex};

use crate::fiber::Fiber;

pub(crate) use worker::Worker;

pub(crate) struct Scheduler {
    injector: Injector<Arc<Fiber>>,
    stealers: Vec<Stealer<Arc<Fiber>>>,
    locals: Mutex<Option<Vec<LocalQueue<Arc<Fiber>>>>>,
    sleep: Mutex<()>,
    wakeup: Condvar,
}

impl Scheduler {
    pub fn new(workers: usize) -> Self {
        let locals: Vec<_> = (0..workers).map(|_| LocalQueue::new_fifo()).collect();
        let stealers = locals.iter().map(LocalQueue::stealer).collect();
        Self {
            injector: Injector::new(),
            stealers,
            locals: Mutex::new(Some(locals)),
            sleep: Mutex::new(()),
            wakeup: Condvar::new(),
        }
    }

    /// Hand the local queues to the worker threads. Only succeeds once.
    pub fn take_locals(&self) -> Option<Vec<LocalQueue<Arc<Fiber>>>> {
        self.locals.lock().take()
    }

    pub fn schedule(&self, fiber: Arc<Fiber>) {
        self.injector.push(fiber);
        let _guard = self.sleep.lock();
        self.wakeup.notify_one();
    }

    pub fn find_task(&self, local: &LocalQueue<Arc<Fiber>>, index: usize) -> Option<Arc<Fiber>> {
        local.pop().or_else(|| {
            std::iter::repeat_with(|| {
                self.injector.steal_batch_and_pop(local).or_else(|| {
                    self.stealers
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| *i != index)
                        .map(|(_, s)| s.steal())
                        .collect()
                })
            })
            .find(|s| !s.is_retry())
            .and_then(Steal::success)
        })
    }

    /// Sleep until new work is injected, `timeout` passes, or `stop` holds.
    pub fn wait_for_work(&self, timeout: Duration, stop: impl Fn() -> bool) {
        let mut guard = self.sleep.lock();
        if self.injector.is_empty() && !stop() {
            self.wakeup.wait_for(&mut guard, timeout);
        }
    }

    pub fn wake_all(&self) {
        let _guard = self.sleep.lock();
        self.wakeup.notify_all();
    }

    /// Drop every queued fiber. Used at shutdown.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        loop {
            match self.injector.steal() {
                Steal::Success(_) => drained += 1,
                Steal::Retry => continue,
                Steal::Empty => return drained,
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.stealers.len())
            .field("injected", &self.injector.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fiber::FiberRegistry;

    #[test]
    fn test_injected_fibers_come_out_in_order() {
        let registry = FiberRegistry::new();
        let scheduler = Scheduler::new(2);
        let locals = scheduler.take_locals().unwrap();
        assert!(scheduler.take_locals().is_none());

        let fibers: Vec<_> = (0..4).map(|_| registry.acquire()).collect();
        for fiber in &fibers {
            scheduler.schedule(fiber.clone());
        }
        let order: Vec<_> = std::iter::from_fn(|| scheduler.find_task(&locals[0], 0)).map(|f| f.id()).collect();
        assert_eq!(order, fibers.iter().map(|f| f.id()).collect::<Vec<_>>());
    }

    #[test]
    fn test_idle_worker_steals_from_peer() {
        let registry = FiberRegistry::new();
        let scheduler = Scheduler::new(2);
        let locals = scheduler.take_locals().unwrap();
        let fiber = registry.acquire();
        locals[1].push(fiber.clone());

        let stolen = scheduler.find_task(&locals[0], 0).unwrap();
        assert!(Arc::ptr_eq(&stolen, &fiber));
        assert!(scheduler.find_task(&locals[1], 1).is_none());
    }

    #[test]
    fn test_drain_empties_the_injector() {
        let registry = FiberRegistry::new();
        let scheduler = Scheduler::new(1);
        scheduler.schedule(registry.acquire());
        scheduler.schedule(registry.acquire());
        assert_eq!(scheduler.drain(), 2);
        assert_eq!(scheduler.drain(), 0);
    }
}
