//! Worker threads.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use corosensei::CoroutineResult;
use crossbeam_deque::Worker as LocalQueue;

use kiln_runtime::Value;

use crate::fiber::{Fiber, FiberState, Suspend};
use crate::runtime::{panic_message, Runtime, EXIT_FIBER_PANIC};
use crate::safepoint::MutatorId;

pub(crate) struct Worker {
    runtime: Arc<Runtime>,
    index: usize,
    local: LocalQueue<Arc<Fiber>>,
}

impl Worker {
    pub fn new(runtime: Arc<Runtime>, index: usize, local: LocalQueue<Arc<Fiber>>) -> Self {
        Self { runtime, index, local }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name(format!("kiln-worker-{}", self.index)).spawn(move || {
            let runtime = self.runtime.clone();
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| self.run())) {
                runtime.abort(EXIT_FIBER_PANIC);
                panic::resume_unwind(payload);
            }
        })
    }

    fn run(&self) {
        let runtime = &self.runtime;
        let mutator = runtime.mutator(self.index);
        log::debug!("worker {} started", self.index);
        while !runtime.is_exiting() {
            match runtime.scheduler().find_task(&self.local, self.index) {
                Some(fiber) => self.execute(fiber, mutator),
                None => runtime.scheduler().wait_for_work(runtime.config().idle_wait, || runtime.is_exiting()),
            }
        }
        runtime.safepoint().enter_idle(mutator);
        log::debug!("worker {} stopped", self.index);
    }

    /// Run `fiber` until it suspends or finishes.
    fn execute(&self, fiber: Arc<Fiber>, mutator: MutatorId) {
        let runtime = &self.runtime;
        let Some(mut coroutine) = fiber.take_coroutine() else {
            log::warn!("fiber {} was scheduled without a coroutine", fiber.id());
            return;
        };

        runtime.safepoint().enter_working(mutator);
        if runtime.is_exiting() {
            // a failed collection may have left the heap unusable; shutdown unwinds it
            fiber.put_coroutine(coroutine);
            runtime.safepoint().enter_idle(mutator);
            return;
        }
        fiber.set_state(FiberState::Running);
        fiber.mark_scheduled(runtime.now());
        log::trace!("worker {} resumes fiber {}", self.index, fiber.id());

        match panic::catch_unwind(AssertUnwindSafe(|| coroutine.0.resume(self.index))) {
            Ok(CoroutineResult::Yield(Suspend::Yield)) => {
                fiber.put_coroutine(coroutine);
                fiber.set_state(FiberState::Ready);
                runtime.scheduler().schedule(fiber);
            }
            Ok(CoroutineResult::Yield(Suspend::Park)) => {
                // the coroutine must be back in place before a waker can requeue the fiber
                fiber.put_coroutine(coroutine);
                fiber.set_state(FiberState::Waiting);
                if fiber.claim_wake() {
                    self.local.push(fiber);
                }
            }
            Ok(CoroutineResult::Yield(Suspend::Abort)) => {
                fiber.set_state(FiberState::Aborted);
                coroutine.0.force_unwind();
                runtime.stacks.release(coroutine.0.into_stack());
                runtime.retire_fiber(&fiber, Value::NULL, true);
            }
            Ok(CoroutineResult::Return(result)) => {
                fiber.set_state(FiberState::Exited);
                runtime.stacks.release(coroutine.0.into_stack());
                runtime.retire_fiber(&fiber, result, false);
            }
            Err(payload) => {
                log::error!("fiber {} panicked: {}", fiber.id(), panic_message(payload.as_ref()));
                fiber.set_state(FiberState::Aborted);
                runtime.stacks.release(coroutine.0.into_stack());
                runtime.abort(EXIT_FIBER_PANIC);
                runtime.retire_fiber(&fiber, Value::NULL, true);
            }
        }

        runtime.safepoint().enter_idle(mutator);
    }
}
