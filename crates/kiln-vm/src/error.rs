//! Host-facing runtime errors.

use kiln_runtime::HeapError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("invalid runtime configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Heap(#[from] HeapError),

    #[error("failed to allocate a fiber stack: {0}")]
    Stack(#[source] std::io::Error),

    #[error("failed to spawn worker thread: {0}")]
    SpawnWorker(#[source] std::io::Error),

    #[error("worker thread {0} panicked")]
    WorkerPanicked(usize),

    #[error("runtime has already been started")]
    AlreadyStarted,
}
