//! # kiln-vm
//!
//! The execution core on top of the kiln heap:
//! - `runtime` - owns the heap, worker pool and fibers; `Runtime::run`
//! - `context` - `FiberContext`, the API available inside a fiber
//! - `fiber` - fiber state, registry and stack pool
//! - `scheduler` - work-stealing M:N scheduler
//! - `parking` - address-keyed wait queues for fibers and threads
//! - `lock` - `TinyLock`, `FiberMutex` and object header locks
//! - `safepoint` - stop-the-world coordination for the collector

pub mod config;
pub mod context;
pub mod error;
pub mod fiber;
mod gc_roots;
pub mod lock;
pub mod parking;
pub mod runtime;
pub mod safepoint;
mod scheduler;

pub use config::RuntimeConfig;
pub use context::FiberContext;
pub use error::RuntimeError;
pub use fiber::{CallFrame, FiberHandle, FiberId, FiberState};
pub use lock::{FiberMutex, FiberMutexGuard, TinyLock};
pub use parking::{Park, ParkingLot, ThreadPark, Unpark, UnparkResult};
pub use runtime::{
    ExitReport, Runtime, UncaughtException, EXIT_FIBER_PANIC, EXIT_HEAP_EXHAUSTED, EXIT_SUCCESS,
    EXIT_UNCAUGHT_EXCEPTION,
};
pub use safepoint::{GcState, GlobalState, MutatorId, MutatorState, Safepoint};

pub use kiln_runtime::{Allocate, HandleScope, Symbol, Value};
