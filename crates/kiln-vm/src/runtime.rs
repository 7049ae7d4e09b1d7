//! The runtime: owns the heap, the worker pool and every fiber.
//!
//! ```ignore
//! let runtime = Runtime::new(RuntimeConfig::default().with_workers(4))?;
//! let report = runtime.run(|ctx| {
//!     let child = ctx.spawn(|_| Value::int(21)).unwrap();
//!     Value::int(ctx.join(&child).as_int() * 2)
//! })?;
//! assert_eq!(report.exit_code, 0);
//! ```

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use corosensei::{Coroutine, Yielder};
use parking_lot::{Condvar, Mutex};

use kiln_runtime::objects::{instance, string};
use kiln_runtime::shape::exception_fields;
use kiln_runtime::{GcStats, Heap, HeapConfig, HeapError, ShapeId, ShapeTable, SymbolTable, Value};

use crate::config::RuntimeConfig;
use crate::context::FiberContext;
use crate::error::RuntimeError;
use crate::fiber::{
    Completion, Fiber, FiberBody, FiberCoroutine, FiberHandle, FiberId, FiberRegistry, FiberState, StackPool, Suspend,
};
use crate::parking::ParkingLot;
use crate::safepoint::{MutatorId, Safepoint};
use crate::scheduler::{Scheduler, Worker};

pub const EXIT_SUCCESS: i32 = 0;
/// The main fiber finished with an exception.
pub const EXIT_UNCAUGHT_EXCEPTION: i32 = 1;
pub const EXIT_HEAP_EXHAUSTED: i32 = 2;
/// A fiber body panicked.
pub const EXIT_FIBER_PANIC: i32 = 101;

/// An exception no fiber caught.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UncaughtException {
    pub fiber: FiberId,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ExitReport {
    pub exit_code: i32,
    pub uncaught: Vec<UncaughtException>,
    pub gc: GcStats,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct ExitState {
    code: Mutex<Option<i32>>,
    exiting: AtomicBool,
    signal: Condvar,
    uncaught: Mutex<Vec<UncaughtException>>,
}

pub struct Runtime {
    config: RuntimeConfig,
    heap: Heap,
    symbols: SymbolTable,
    shapes: ShapeTable,
    parking: Arc<ParkingLot>,
    safepoint: Safepoint,
    mutators: Vec<MutatorId>,
    scheduler: Scheduler,
    pub(crate) fibers: FiberRegistry,
    pub(crate) stacks: StackPool,
    /// Join points of fibers that may still be observed.
    pub(crate) completions: Mutex<Vec<Weak<Completion>>>,
    exit: ExitState,
    gc_stats: Mutex<GcStats>,
    epoch: Instant,
    started: AtomicBool,
    #[cfg(test)]
    fail_next_collection: AtomicBool,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Arc<Self>, RuntimeError> {
        config.validate()?;
        let heap = Heap::new(&HeapConfig {
            heap_size: config.heap_size,
            region_size: config.region_size,
            allocation_buffers: config.worker_count,
        })?;
        let symbols = SymbolTable::new();
        let shapes = ShapeTable::new(&symbols);
        let parking = Arc::new(ParkingLot::default());
        let safepoint = Safepoint::new(parking.clone(), config.safepoint_poll_interval);
        let mutators = (0..config.worker_count).map(|_| safepoint.register()).collect();
        log::debug!(
            "runtime created: {} workers, {} byte heap in {} byte regions",
            config.worker_count,
            config.heap_size,
            config.region_size
        );

        Ok(Arc::new(Self {
            scheduler: Scheduler::new(config.worker_count),
            stacks: StackPool::new(config.fiber_stack_size, config.max_pooled_stacks),
            config,
            heap,
            symbols,
            shapes,
            parking,
            safepoint,
            mutators,
            fibers: FiberRegistry::new(),
            completions: Mutex::new(Vec::new()),
            exit: ExitState::default(),
            gc_stats: Mutex::new(GcStats::default()),
            epoch: Instant::now(),
            started: AtomicBool::new(false),
            #[cfg(test)]
            fail_next_collection: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn shapes(&self) -> &ShapeTable {
        &self.shapes
    }

    pub fn parking_lot(&self) -> &ParkingLot {
        &self.parking
    }

    pub fn safepoint(&self) -> &Safepoint {
        &self.safepoint
    }

    pub fn gc_stats(&self) -> GcStats {
        *self.gc_stats.lock()
    }

    pub fn is_exiting(&self) -> bool {
        self.exit.exiting.load(Ordering::SeqCst)
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit.code.lock()
    }

    /// Fiber stacks waiting for reuse.
    pub fn pooled_stacks(&self) -> usize {
        self.stacks.pooled()
    }

    /// Fibers that have been spawned and not yet recycled.
    pub fn live_fibers(&self) -> usize {
        self.fibers.live_count()
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub(crate) fn mutator(&self, worker: usize) -> MutatorId {
        self.mutators[worker]
    }

    /// Runtime clock in nanoseconds.
    pub(crate) fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Run `main` as the first fiber and block until the runtime exits.
    ///
    /// The runtime exits when the main fiber returns or when any fiber
    /// aborts. Fibers still alive at that point are unwound.
    pub fn run<F>(self: &Arc<Self>, main: F) -> Result<ExitReport, RuntimeError>
    where
        F: FnOnce(&FiberContext<'_>) -> Value + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(RuntimeError::AlreadyStarted);
        }
        let locals = self.scheduler.take_locals().ok_or(RuntimeError::AlreadyStarted)?;
        self.spawn_fiber(Box::new(main), true)?;

        let mut threads = Vec::with_capacity(locals.len());
        for (index, local) in locals.into_iter().enumerate() {
            match Worker::new(self.clone(), index, local).spawn() {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    // no report is produced, the code is never observed
                    self.request_exit(EXIT_SUCCESS);
                    for thread in threads {
                        let _ = thread.join();
                    }
                    self.shutdown();
                    return Err(RuntimeError::SpawnWorker(e));
                }
            }
        }

        self.wait_for_exit();
        let mut panicked = None;
        for (index, thread) in threads.into_iter().enumerate() {
            if thread.join().is_err() {
                log::error!("worker {} panicked", index);
                panicked.get_or_insert(index);
            }
        }
        self.shutdown();
        if let Some(index) = panicked {
            return Err(RuntimeError::WorkerPanicked(index));
        }

        let report = ExitReport {
            exit_code: self.exit_code().unwrap_or(EXIT_SUCCESS),
            uncaught: self.exit.uncaught.lock().clone(),
            gc: self.gc_stats(),
            elapsed: self.epoch.elapsed(),
        };
        log::debug!("runtime exited with code {} after {:?}", report.exit_code, report.elapsed);
        Ok(report)
    }

    /// Stop the runtime with `code`. Only the first request sets the code.
    pub fn abort(&self, code: i32) {
        if self.request_exit(code) {
            log::error!("runtime aborted with exit code {}", code);
        }
    }

    fn request_exit(&self, code: i32) -> bool {
        let mut current = self.exit.code.lock();
        if current.is_some() {
            return false;
        }
        *current = Some(code);
        self.exit.exiting.store(true, Ordering::SeqCst);
        self.exit.signal.notify_all();
        drop(current);
        self.scheduler.wake_all();
        true
    }

    fn wait_for_exit(&self) {
        let mut code = self.exit.code.lock();
        while code.is_none() {
            self.exit.signal.wait(&mut code);
        }
    }

    /// Drop everything still queued or suspended. Workers must be joined.
    fn shutdown(&self) {
        let drained = self.scheduler.drain();
        let mut unwound = 0;
        for fiber in self.fibers.snapshot() {
            // dropping a suspended coroutine unwinds its stack
            if let Some(coroutine) = fiber.take_coroutine() {
                drop(coroutine);
                unwound += 1;
            }
        }
        log::debug!("shutdown dropped {} queued fibers, unwound {} suspended fibers", drained, unwound);
    }

    // -------------------------------------------------------------------------
    // Fibers
    // -------------------------------------------------------------------------

    pub(crate) fn spawn_fiber(self: &Arc<Self>, body: FiberBody, is_main: bool) -> Result<FiberHandle, RuntimeError> {
        let stack = self.stacks.acquire().map_err(RuntimeError::Stack)?;
        let fiber = self.fibers.acquire();
        let completion = Arc::new(Completion::default());
        {
            let mut completions = self.completions.lock();
            if completions.len() >= 64 && completions.len().is_power_of_two() {
                completions.retain(|c| c.strong_count() > 0);
            }
            completions.push(Arc::downgrade(&completion));
        }
        {
            let mut data = fiber.data.lock();
            data.completion = Some(completion.clone());
            data.is_main = is_main;
        }

        let runtime = self.clone();
        let target = fiber.clone();
        let coroutine = Coroutine::with_stack(stack, move |yielder: &Yielder<usize, Suspend>, worker: usize| {
            let ctx = FiberContext::new(runtime, target, yielder, worker);
            ctx.start();
            let result = body(&ctx);
            ctx.finish(result)
        });
        fiber.put_coroutine(FiberCoroutine(coroutine));
        fiber.set_state(FiberState::Ready);
        log::trace!("spawned fiber {}", fiber.id());

        let handle = FiberHandle { id: fiber.id(), completion };
        self.scheduler.schedule(fiber);
        Ok(handle)
    }

    /// Requeue a parked fiber. Safe to call before the fiber has finished
    /// suspending.
    pub(crate) fn wake(&self, fiber: &Arc<Fiber>) {
        if fiber.request_wake() {
            log::trace!("woke fiber {}", fiber.id());
            self.scheduler.schedule(fiber.clone());
        }
    }

    /// Publish the outcome of a finished fiber and recycle it.
    pub(crate) fn retire_fiber(&self, fiber: &Arc<Fiber>, result: Value, aborted: bool) {
        let (completion, exception, is_main) = {
            let mut data = fiber.data.lock();
            let exception = data.pending_exception.filter(|_| result.is_error_exception());
            (data.completion.take(), exception, data.is_main)
        };

        if let Some(exception) = exception {
            self.report_uncaught(fiber.id(), exception);
        }
        if let Some(completion) = completion {
            let result = if result.is_error_exception() { Value::NULL } else { result };
            completion.complete(result, exception);
            self.parking.unpark_all(completion.key());
        }
        if is_main && !aborted {
            self.request_exit(if exception.is_some() { EXIT_UNCAUGHT_EXCEPTION } else { EXIT_SUCCESS });
        }

        log::trace!("fiber {} retired", fiber.id());
        self.fibers.release(fiber);
    }

    fn report_uncaught(&self, fiber: FiberId, exception: Value) {
        let message = self.describe_exception(exception);
        log::warn!("uncaught exception in fiber {}: {}", fiber, message);
        self.exit.uncaught.lock().push(UncaughtException { fiber, message });
    }

    /// Message of an exception instance, or the string itself for a thrown string.
    pub fn describe_exception(&self, exception: Value) -> String {
        let heap = &self.heap;
        if exception.is_pointer() && heap.shape_of(exception) == ShapeId::EXCEPTION {
            let message = instance::field_at(heap, exception, exception_fields::MESSAGE);
            return string::to_string(heap, message).unwrap_or_default();
        }
        string::to_string(heap, exception).unwrap_or_else(|| format!("{:?}", exception))
    }

    // -------------------------------------------------------------------------
    // Collection
    // -------------------------------------------------------------------------

    /// Collect the heap. Every other mutator must be stopped.
    pub(crate) fn collect(&self) -> Result<GcStats, HeapError> {
        let started = Instant::now();
        #[cfg(test)]
        if self.fail_next_collection.swap(false, Ordering::SeqCst) {
            return Err(HeapError::Exhausted { requested: 0 });
        }
        let stats = kiln_runtime::collect(&self.heap, self, self.config.promotion_threshold)?;
        self.gc_stats.lock().merge(&stats);
        log::debug!("gc pause of {} mutators took {:?}", self.mutators.len(), started.elapsed());
        Ok(stats)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("workers", &self.config.worker_count)
            .field("heap", &self.heap)
            .field("exit_code", &self.exit_code())
            .finish_non_exhaustive()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
