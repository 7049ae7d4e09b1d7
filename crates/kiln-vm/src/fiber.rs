//! Fibers: green threads with their own machine stack.
//!
//! A `Fiber` is the schedulable unit. Its coroutine runs on a pooled stack
//! and suspends back to the worker with a [`Suspend`] reason. Fibers are
//! recycled: an exited fiber is cleaned and kept on a free list, and its
//! stack goes back to the `StackPool`.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use corosensei::stack::DefaultStack;
use corosensei::Coroutine;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;

use kiln_runtime::{HandleList, Symbol, Value};

use crate::context::FiberContext;

pub type FiberId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FiberState {
    /// On the free list.
    Free = 0,
    /// Queued for a worker.
    Ready = 1,
    Running = 2,
    /// Parked on a key.
    Waiting = 3,
    /// Running native code that does not touch the heap.
    Native = 4,
    Exited = 5,
    Aborted = 6,
}

impl FiberState {
    pub fn is_finished(self) -> bool {
        matches!(self, FiberState::Exited | FiberState::Aborted)
    }
}

/// Why a coroutine handed control back to its worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Suspend {
    Yield,
    Park,
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFrame {
    pub name: Symbol,
    pub ip: usize,
    pub self_value: Value,
}

pub(crate) type FiberBody = Box<dyn FnOnce(&FiberContext<'_>) -> Value + Send>;

pub(crate) struct FiberCoroutine(pub Coroutine<usize, Suspend, Value, DefaultStack>);

// SAFETY: a coroutine is only resumed by the worker holding it, and it is
// moved between workers only while suspended.
unsafe impl Send for FiberCoroutine {}

// =============================================================================
// Completion
// =============================================================================

#[derive(Debug, Default)]
struct Outcome {
    result: Value,
    exception: Option<Value>,
}

/// Outcome of a fiber, shared between the fiber and anyone joining it.
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
    outcome: Mutex<Outcome>,
}

impl Completion {
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Parking key for joiners.
    pub(crate) fn key(&self) -> usize {
        &self.done as *const AtomicBool as usize
    }

    pub(crate) fn complete(&self, result: Value, exception: Option<Value>) {
        *self.outcome.lock() = Outcome { result, exception };
        self.done.store(true, Ordering::Release);
    }

    /// `(result, exception)` once the fiber is finished.
    pub fn outcome(&self) -> Option<(Value, Option<Value>)> {
        if !self.is_done() {
            return None;
        }
        let outcome = self.outcome.lock();
        Some((outcome.result, outcome.exception))
    }

    pub(crate) fn visit_roots(&self, visitor: &mut dyn FnMut(Value) -> Value) {
        let mut outcome = self.outcome.lock();
        outcome.result = visitor(outcome.result);
        if let Some(exception) = outcome.exception.as_mut() {
            *exception = visitor(*exception);
        }
    }
}

/// Host-side reference to a spawned fiber.
#[derive(Debug, Clone)]
pub struct FiberHandle {
    pub(crate) id: FiberId,
    pub(crate) completion: Arc<Completion>,
}

impl FiberHandle {
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    pub fn outcome(&self) -> Option<(Value, Option<Value>)> {
        self.completion.outcome()
    }
}

// =============================================================================
// Fiber
// =============================================================================

#[derive(Debug)]
pub(crate) struct FiberData {
    pub pending_exception: Option<Value>,
    pub frames: Vec<CallFrame>,
    pub bound_object: Value,
    pub completion: Option<Arc<Completion>>,
    pub is_main: bool,
}

impl Default for FiberData {
    fn default() -> Self {
        Self {
            pending_exception: None,
            frames: Vec::new(),
            bound_object: Value::NULL,
            completion: None,
            is_main: false,
        }
    }
}

pub struct Fiber {
    id: AtomicU64,
    state: AtomicU8,
    wake_pending: AtomicBool,
    /// Runtime clock (nanoseconds) when the current slice started.
    scheduled_at: AtomicU64,
    pub(crate) data: Mutex<FiberData>,
    handles: HandleList,
    coroutine: Mutex<Option<FiberCoroutine>>,
}

impl Fiber {
    fn new(id: FiberId) -> Self {
        Self {
            id: AtomicU64::new(id),
            state: AtomicU8::new(FiberState::Free.into()),
            wake_pending: AtomicBool::new(false),
            scheduled_at: AtomicU64::new(0),
            data: Mutex::new(FiberData::default()),
            handles: HandleList::new(),
            coroutine: Mutex::new(None),
        }
    }

    pub fn id(&self) -> FiberId {
        self.id.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> FiberState {
        FiberState::try_from(self.state.load(Ordering::SeqCst)).unwrap_or(FiberState::Aborted)
    }

    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state.into(), Ordering::SeqCst);
    }

    pub fn handles(&self) -> &HandleList {
        &self.handles
    }

    pub(crate) fn scheduled_at(&self) -> u64 {
        self.scheduled_at.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_scheduled(&self, now: u64) {
        self.scheduled_at.store(now, Ordering::Relaxed);
    }

    // ---- wake protocol ----
    //
    // Exactly one of the waker and the parking worker claims a wakeup: each
    // publishes its half (`wake_pending` / `Waiting`) before swapping the
    // flag back to false, and only the swap that observes `true` requeues.

    /// Waker side. Returns true if the caller must schedule the fiber.
    pub(crate) fn request_wake(&self) -> bool {
        self.wake_pending.store(true, Ordering::SeqCst);
        self.state() == FiberState::Waiting && self.claim_wake()
    }

    /// Worker side, after the fiber was marked `Waiting`.
    pub(crate) fn claim_wake(&self) -> bool {
        if !self.wake_pending.swap(false, Ordering::SeqCst) {
            return false;
        }
        self.set_state(FiberState::Ready);
        true
    }

    pub(crate) fn take_coroutine(&self) -> Option<FiberCoroutine> {
        self.coroutine.lock().take()
    }

    pub(crate) fn put_coroutine(&self, coroutine: FiberCoroutine) {
        *self.coroutine.lock() = Some(coroutine);
    }

    pub fn pending_exception(&self) -> Option<Value> {
        self.data.lock().pending_exception
    }

    pub fn frames(&self) -> Vec<CallFrame> {
        self.data.lock().frames.clone()
    }

    pub(crate) fn visit_roots(&self, visitor: &mut dyn FnMut(Value) -> Value) {
        self.handles.visit_slots(visitor);
        let mut data = self.data.lock();
        if let Some(exception) = data.pending_exception.as_mut() {
            *exception = visitor(*exception);
        }
        data.bound_object = visitor(data.bound_object);
        for frame in data.frames.iter_mut() {
            frame.self_value = visitor(frame.self_value);
        }
    }

    /// Reset everything but the id for reuse.
    fn clean(&self) {
        self.handles.clear();
        *self.data.lock() = FiberData::default();
        self.wake_pending.store(false, Ordering::SeqCst);
        self.scheduled_at.store(0, Ordering::Relaxed);
        debug_assert!(self.coroutine.lock().is_none());
        self.set_state(FiberState::Free);
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber").field("id", &self.id()).field("state", &self.state()).finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Debug)]
pub(crate) struct FiberRegistry {
    all: Mutex<Vec<Arc<Fiber>>>,
    free: Mutex<Vec<Arc<Fiber>>>,
    next_id: AtomicU64,
}

impl FiberRegistry {
    pub fn new() -> Self {
        Self { all: Mutex::new(Vec::new()), free: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
    }

    /// A clean fiber with a fresh id.
    pub fn acquire(&self) -> Arc<Fiber> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(fiber) = self.free.lock().pop() {
            fiber.id.store(id, Ordering::Relaxed);
            return fiber;
        }
        let fiber = Arc::new(Fiber::new(id));
        self.all.lock().push(fiber.clone());
        fiber
    }

    pub fn release(&self, fiber: &Arc<Fiber>) {
        fiber.clean();
        self.free.lock().push(fiber.clone());
    }

    pub fn snapshot(&self) -> Vec<Arc<Fiber>> {
        self.all.lock().clone()
    }

    pub fn live_count(&self) -> usize {
        self.all.lock().len() - self.free.lock().len()
    }
}

// =============================================================================
// Stack pool
// =============================================================================

struct PooledStack(DefaultStack);

// SAFETY: pooled stacks are not in use by any coroutine.
unsafe impl Send for PooledStack {}

pub(crate) struct StackPool {
    stacks: Mutex<Vec<PooledStack>>,
    stack_size: usize,
    max_pooled: usize,
}

impl StackPool {
    pub fn new(stack_size: usize, max_pooled: usize) -> Self {
        Self { stacks: Mutex::new(Vec::new()), stack_size, max_pooled }
    }

    pub fn acquire(&self) -> io::Result<DefaultStack> {
        match self.stacks.lock().pop() {
            Some(PooledStack(stack)) => Ok(stack),
            None => DefaultStack::new(self.stack_size),
        }
    }

    pub fn release(&self, stack: DefaultStack) {
        let mut stacks = self.stacks.lock();
        if stacks.len() < self.max_pooled {
            stacks.push(PooledStack(stack));
        }
    }

    pub fn pooled(&self) -> usize {
        self.stacks.lock().len()
    }
}

impl std::fmt::Debug for StackPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackPool")
            .field("pooled", &self.pooled())
            .field("stack_size", &self.stack_size)
            .finish()
    }
}
