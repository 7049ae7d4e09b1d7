//! `FiberContext`: everything a fiber body can do.
//!
//! A context lives on the fiber's own stack for the whole run of its body.
//! Suspending through it (yield, park, abort) hands control back to the
//! worker; the worker that resumes the fiber may be a different one.

use std::cell::Cell;
use std::fmt;
use std::sync::{Arc, Weak};

use corosensei::Yielder;

use kiln_runtime::header::{HEADER_SIZE, MAX_COUNT};
use kiln_runtime::objects::{instance, string, tuple, Allocate};
use kiln_runtime::shape::fiber_fields;
use kiln_runtime::{
    Address, Handle, HandleList, HandleScope, Heap, HeapError, ShapeId, ShapeTable, Symbol, SymbolTable, Value,
};

use crate::error::RuntimeError;
use crate::fiber::{CallFrame, Fiber, FiberHandle, FiberId, FiberState, Suspend};
use crate::parking::{Park, ParkingLot, Unpark};
use crate::runtime::{Runtime, EXIT_HEAP_EXHAUSTED};
use crate::safepoint::MutatorId;

pub struct FiberContext<'y> {
    runtime: Arc<Runtime>,
    fiber: Arc<Fiber>,
    yielder: &'y Yielder<usize, Suspend>,
    /// Index of the worker currently running this fiber.
    worker: Cell<usize>,
}

impl<'y> FiberContext<'y> {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        fiber: Arc<Fiber>,
        yielder: &'y Yielder<usize, Suspend>,
        worker: usize,
    ) -> Self {
        Self { runtime, fiber, yielder, worker: Cell::new(worker) }
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn heap(&self) -> &Heap {
        self.runtime.heap()
    }

    pub fn shapes(&self) -> &ShapeTable {
        self.runtime.shapes()
    }

    pub fn symbols(&self) -> &SymbolTable {
        self.runtime.symbols()
    }

    pub fn fiber_id(&self) -> FiberId {
        self.fiber.id()
    }

    /// The heap object representing this fiber.
    pub fn fiber_object(&self) -> Value {
        self.fiber.data.lock().bound_object
    }

    pub fn handles(&self) -> &HandleList {
        self.fiber.handles()
    }

    pub fn worker_index(&self) -> usize {
        self.worker.get()
    }

    fn mutator(&self) -> MutatorId {
        self.runtime.mutator(self.worker.get())
    }

    fn suspend(&self, reason: Suspend) {
        let worker = self.yielder.suspend(reason);
        self.worker.set(worker);
    }

    // -------------------------------------------------------------------------
    // Scheduling
    // -------------------------------------------------------------------------

    /// Poll point for loop back-edges, calls and allocation sites.
    ///
    /// Terminates the fiber if the runtime is exiting, waits out a pending
    /// collection, and yields once the time slice is used up.
    pub fn checkpoint(&self) {
        if self.runtime.is_exiting() {
            self.terminate();
        }
        if self.runtime.safepoint().checkpoint(self.mutator()) && self.runtime.is_exiting() {
            self.terminate();
        }
        let elapsed = self.runtime.now().saturating_sub(self.fiber.scheduled_at());
        if elapsed >= self.runtime.config().timeslice.as_nanos() as u64 {
            self.yield_to_scheduler();
        }
    }

    pub fn yield_to_scheduler(&self) {
        log::trace!("fiber {} yields on worker {}", self.fiber_id(), self.worker.get());
        self.suspend(Suspend::Yield);
    }

    fn terminate(&self) -> ! {
        // the worker unwinds this stack instead of resuming it
        loop {
            self.yielder.suspend(Suspend::Abort);
        }
    }

    /// Stop the whole runtime with `code`. Every other fiber terminates at
    /// its next checkpoint.
    pub fn abort(&self, code: i32) -> ! {
        log::error!("fiber {} aborts the runtime with exit code {}", self.fiber_id(), code);
        self.runtime.abort(code);
        self.terminate()
    }

    /// Promise not to touch the heap until `exit_native`. Collections do
    /// not wait for a fiber in this state.
    pub fn enter_native(&self) {
        self.fiber.set_state(FiberState::Native);
        self.runtime.safepoint().enter_native(self.mutator());
    }

    pub fn exit_native(&self) {
        self.runtime.safepoint().exit_native(self.mutator());
        self.fiber.set_state(FiberState::Running);
    }

    pub fn native<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_native();
        let result = f();
        self.exit_native();
        result
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate `size` payload bytes. Collects and retries once when eden is
    /// used up; if that still fails the runtime is aborted.
    pub fn allocate(&self, size: usize, contains_external_heap_pointers: bool) -> Address {
        match self.allocate_rooted(size, contains_external_heap_pointers, &mut []) {
            Ok(address) => address,
            Err(e) => {
                log::error!("fiber {}: {}", self.fiber_id(), e);
                self.abort(EXIT_HEAP_EXHAUSTED)
            }
        }
    }

    /// Run a full collection. Returns false if another mutator collected
    /// while this one waited.
    pub fn collect_garbage(&self) -> bool {
        let mutator = self.mutator();
        let safepoint = self.runtime.safepoint();
        if !safepoint.request_gc(mutator) {
            if self.runtime.is_exiting() {
                self.terminate();
            }
            return false;
        }
        let result = self.runtime.collect();
        if let Err(e) = &result {
            // the heap is half evacuated: nobody may run mutator code on it again
            log::error!("garbage collection failed: {}", e);
            self.runtime.abort(EXIT_HEAP_EXHAUSTED);
        }
        safepoint.finish_gc(mutator);
        if result.is_err() {
            self.terminate();
        }
        true
    }

    /// Allocation sites are poll points: wait out a pause another mutator
    /// requested, and stop if the runtime is exiting.
    fn poll_allocation(&self, roots: &mut [Value]) {
        if !self.runtime.safepoint().is_gc_requested() {
            return;
        }
        self.with_rooted(roots, || {
            if self.runtime.safepoint().checkpoint(self.mutator()) && self.runtime.is_exiting() {
                self.terminate();
            }
        });
    }

    /// Run `f` with `roots` registered as handles, then read them back.
    fn with_rooted(&self, roots: &mut [Value], f: impl FnOnce()) {
        let scope = HandleScope::new(self.handles());
        let rooted: Vec<Handle<'_>> = roots.iter().map(|v| scope.handle(*v)).collect();
        f();
        for (slot, handle) in roots.iter_mut().zip(&rooted) {
            *slot = handle.get();
        }
        // handles pop in LIFO order
        for handle in rooted.into_iter().rev() {
            drop(handle);
        }
    }

    // -------------------------------------------------------------------------
    // Exceptions
    // -------------------------------------------------------------------------

    /// Throw a new exception with a formatted message.
    ///
    /// ```ignore
    /// return ctx.throw_message(format_args!("index {} out of range", i));
    /// ```
    pub fn throw_message(&self, args: fmt::Arguments<'_>) -> Value {
        let exception = self.create_exception(&args.to_string());
        self.throw_exception(exception)
    }

    pub fn throw_exception(&self, exception: Value) -> Value {
        self.fiber.data.lock().pending_exception = Some(exception);
        Value::ERROR_EXCEPTION
    }

    pub fn pending_exception(&self) -> Option<Value> {
        self.fiber.pending_exception()
    }

    /// Clear and return the pending exception.
    pub fn reset_pending_exception(&self) -> Option<Value> {
        self.fiber.data.lock().pending_exception.take()
    }

    /// Exception instance holding `message` and the current stack trace.
    pub fn create_exception(&self, message: &str) -> Value {
        let limit = MAX_COUNT.min(self.heap().region_size() - HEADER_SIZE);
        let text = string::create_string(self, truncate(message, limit)).unwrap_or(Value::NULL);

        let scope = HandleScope::new(self.handles());
        let text = scope.handle(text);
        let frames: Vec<Value> = self.stack_trace().iter().map(|f| Value::symbol(f.name)).collect();
        let stack = tuple::create(self, &frames).unwrap_or(Value::NULL);
        instance::create_with(self, self.shapes(), ShapeId::EXCEPTION, &[text.get(), stack]).unwrap_or(Value::NULL)
    }

    // -------------------------------------------------------------------------
    // Frames
    // -------------------------------------------------------------------------

    pub fn push_frame(&self, frame: CallFrame) {
        self.fiber.data.lock().frames.push(frame);
    }

    pub fn pop_frame(&self) -> Option<CallFrame> {
        self.fiber.data.lock().frames.pop()
    }

    /// Active frames, innermost first.
    pub fn stack_trace(&self) -> Vec<CallFrame> {
        let mut frames = self.fiber.frames();
        frames.reverse();
        frames
    }

    // -------------------------------------------------------------------------
    // Symbols
    // -------------------------------------------------------------------------

    pub fn declare_symbol(&self, name: &str) -> Symbol {
        self.symbols().declare(name)
    }

    /// String value of `symbol`. Created on first use and shared by every
    /// fiber afterwards.
    pub fn lookup_symbol(&self, symbol: Symbol) -> Value {
        let symbols = self.symbols();
        if let Some(value) = symbols.cached_value(symbol) {
            return value;
        }
        let Some(name) = symbols.name(symbol) else {
            return Value::ERROR_NOT_FOUND;
        };
        match string::create_string(self, &name) {
            Ok(value) => symbols.cache_value(symbol, value),
            Err(_) => Value::ERROR_NOT_FOUND,
        }
    }

    // -------------------------------------------------------------------------
    // Fibers
    // -------------------------------------------------------------------------

    pub fn spawn<F>(&self, body: F) -> Result<FiberHandle, RuntimeError>
    where
        F: FnOnce(&FiberContext<'_>) -> Value + Send + 'static,
    {
        self.runtime.spawn_fiber(Box::new(body), false)
    }

    /// Wait for `handle` to finish and return its result. If it finished with
    /// an exception, the exception is rethrown in this fiber.
    pub fn join(&self, handle: &FiberHandle) -> Value {
        let completion = &handle.completion;
        loop {
            if let Some((result, exception)) = completion.outcome() {
                return match exception {
                    Some(exception) => self.throw_exception(exception),
                    None => result,
                };
            }
            self.park(completion.key(), &mut || !completion.is_done());
        }
    }

    pub(crate) fn start(&self) {
        let id = Value::int(self.fiber_id() as i64);
        match instance::create_with(self, self.shapes(), ShapeId::FIBER, &[id]) {
            Ok(object) => self.fiber.data.lock().bound_object = object,
            Err(e) => {
                log::error!("cannot create the object of fiber {}: {}", self.fiber_id(), e);
                self.abort(EXIT_HEAP_EXHAUSTED)
            }
        }
    }

    pub(crate) fn finish(&self, result: Value) -> Value {
        let data = self.fiber.data.lock();
        let object = data.bound_object;
        if object.is_pointer() {
            let heap = self.heap();
            let exception = data.pending_exception.filter(|_| result.is_error_exception());
            instance::set_field_at(heap, object, fiber_fields::RESULT, result);
            instance::set_field_at(heap, object, fiber_fields::EXCEPTION, exception.unwrap_or(Value::NULL));
        }
        result
    }
}

impl Allocate for FiberContext<'_> {
    fn heap(&self) -> &Heap {
        self.runtime.heap()
    }

    fn allocate_rooted(
        &self,
        size: usize,
        contains_external_heap_pointers: bool,
        roots: &mut [Value],
    ) -> Result<Address, HeapError> {
        self.poll_allocation(roots);
        let heap = self.runtime.heap();
        match heap.allocate(self.worker.get(), size, contains_external_heap_pointers) {
            Err(HeapError::Exhausted { .. }) => {}
            other => return other,
        }

        // eden is used up; the evacuation reserve guarantees the collection room
        self.with_rooted(roots, || {
            self.collect_garbage();
        });

        match heap.allocate(self.worker.get(), size, contains_external_heap_pointers) {
            Err(e @ HeapError::Exhausted { .. }) => {
                log::error!("fiber {}: {} after collection", self.fiber_id(), e);
                self.abort(EXIT_HEAP_EXHAUSTED)
            }
            other => other,
        }
    }
}

// =============================================================================
// Parking
// =============================================================================

struct FiberWaker {
    runtime: Weak<Runtime>,
    fiber: Arc<Fiber>,
}

impl Unpark for FiberWaker {
    fn unpark(&self) {
        if let Some(runtime) = self.runtime.upgrade() {
            runtime.wake(&self.fiber);
        }
    }
}

impl Park for FiberContext<'_> {
    fn parking_lot(&self) -> &ParkingLot {
        self.runtime.parking_lot()
    }

    fn park(&self, key: usize, validate: &mut dyn FnMut() -> bool) -> bool {
        let waker = Arc::new(FiberWaker { runtime: Arc::downgrade(&self.runtime), fiber: self.fiber.clone() });
        if !self.runtime.parking_lot().enqueue(key, self.fiber_id(), waker, validate) {
            return false;
        }
        self.suspend(Suspend::Park);
        true
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
