//! Root enumeration for the collector.
//!
//! Roots are every fiber's handles, pending exception, bound fiber object
//! and frame receivers, the outcome of every still observable fiber, and
//! the cached symbol strings.

use std::sync::Weak;

use parking_lot::Mutex;

use kiln_runtime::{RootSet, Value};

use crate::fiber::{Completion, FiberRegistry};
use crate::runtime::Runtime;

impl RootSet for Runtime {
    fn visit_roots(&self, visitor: &mut dyn FnMut(Value) -> Value) {
        scan_fibers(&self.fibers, visitor);
        scan_completions(&self.completions, visitor);
        self.symbols().visit_values(visitor);
    }
}

fn scan_fibers(fibers: &FiberRegistry, visitor: &mut dyn FnMut(Value) -> Value) {
    for fiber in fibers.snapshot() {
        fiber.visit_roots(visitor);
    }
}

fn scan_completions(completions: &Mutex<Vec<Weak<Completion>>>, visitor: &mut dyn FnMut(Value) -> Value) {
    let mut completions = completions.lock();
    completions.retain(|completion| match completion.upgrade() {
        Some(completion) => {
            completion.visit_roots(visitor);
            true
        }
        None => false,
    });
}
