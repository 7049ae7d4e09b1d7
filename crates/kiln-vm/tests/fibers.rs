//! Fiber lifecycle: exceptions, aborts, panics and collection inside fibers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use kiln_runtime::objects::{instance, string, tuple};
use kiln_runtime::shape::{exception_fields, fiber_fields};
use kiln_runtime::ShapeId;
use kiln_vm::{
    CallFrame, HandleScope, MutatorState, Runtime, RuntimeConfig, RuntimeError, Value, EXIT_FIBER_PANIC,
    EXIT_HEAP_EXHAUSTED, EXIT_UNCAUGHT_EXCEPTION,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

fn runtime(workers: usize) -> Arc<Runtime> {
    let config = RuntimeConfig::default()
        .with_workers(workers)
        .with_heap_size(4 << 20)
        .with_region_size(64 << 10);
    Runtime::new(config).unwrap()
}

#[test]
fn test_invalid_config_is_rejected() {
    let result = Runtime::new(RuntimeConfig::default().with_workers(0));
    assert!(matches!(result, Err(RuntimeError::InvalidConfig(_))));
}

#[test]
fn test_run_twice_is_rejected() {
    let runtime = runtime(1);
    assert_eq!(runtime.run(|_| Value::NULL).unwrap().exit_code, 0);
    assert!(matches!(runtime.run(|_| Value::NULL), Err(RuntimeError::AlreadyStarted)));
}

#[test]
fn test_uncaught_exception_in_child_is_reported() {
    let runtime = runtime(2);
    let child_id = Arc::new(Mutex::new(None));
    let rethrown = Arc::new(Mutex::new(String::new()));

    let (child_id_in, rethrown_in) = (child_id.clone(), rethrown.clone());
    let report = runtime
        .run(move |ctx| {
            let child = ctx.spawn(|ctx| ctx.throw_message(format_args!("bad index {}", 7))).unwrap();
            *child_id_in.lock() = Some(child.id());
            assert!(ctx.join(&child).is_error_exception());
            let exception = ctx.reset_pending_exception().unwrap();
            *rethrown_in.lock() = ctx.runtime().describe_exception(exception);
            Value::NULL
        })
        .unwrap();

    assert_eq!(report.exit_code, 0);
    assert_eq!(report.uncaught.len(), 1);
    assert_eq!(Some(report.uncaught[0].fiber), *child_id.lock());
    assert_eq!(report.uncaught[0].message, "bad index 7");
    assert_eq!(*rethrown.lock(), "bad index 7");
}

#[test]
fn test_main_exception_sets_exit_code() {
    let report = runtime(1).run(|ctx| ctx.throw_message(format_args!("boom"))).unwrap();
    assert_eq!(report.exit_code, EXIT_UNCAUGHT_EXCEPTION);
    assert_eq!(report.uncaught.len(), 1);
    assert_eq!(report.uncaught[0].message, "boom");
}

#[test]
fn test_abort_terminates_every_fiber() {
    let runtime = runtime(2);
    let report = runtime
        .run(|ctx| {
            for _ in 0..4 {
                ctx.spawn(|ctx| loop {
                    ctx.checkpoint();
                })
                .unwrap();
            }
            ctx.yield_to_scheduler();
            ctx.abort(42)
        })
        .unwrap();
    assert_eq!(report.exit_code, 42);
}

#[test]
fn test_child_abort_stops_main() {
    let report = runtime(2)
        .run(|ctx| {
            ctx.spawn(|ctx| ctx.abort(7)).unwrap();
            loop {
                ctx.checkpoint();
            }
        })
        .unwrap();
    assert_eq!(report.exit_code, 7);
}

#[test]
fn test_fiber_panic_aborts_runtime() {
    let report = runtime(2)
        .run(|ctx| {
            ctx.spawn(|_| panic!("kaboom")).unwrap();
            loop {
                ctx.checkpoint();
            }
        })
        .unwrap();
    assert_eq!(report.exit_code, EXIT_FIBER_PANIC);
}

#[test]
fn test_single_worker_panic_recycles_the_stack() {
    let runtime = runtime(1);
    let report = runtime
        .run(|ctx| {
            ctx.spawn(|_| panic!("kaboom")).unwrap();
            loop {
                ctx.checkpoint();
            }
        })
        .unwrap();
    assert_eq!(report.exit_code, EXIT_FIBER_PANIC);
    assert_eq!(runtime.pooled_stacks(), 1);
}

#[test]
fn test_garbage_churn_far_past_heap_size() {
    for workers in [1, 2] {
        let config = RuntimeConfig::default()
            .with_workers(workers)
            .with_heap_size(1 << 20)
            .with_region_size(64 << 10);
        let runtime = Runtime::new(config).unwrap();
        let report = runtime
            .run(|ctx| {
                let scope = HandleScope::new(ctx.handles());
                let keep = scope.handle(string::create_string(ctx, "still here after the churn").unwrap());
                // about 4.8 MB of short-lived tuples on a 1 MiB heap
                for _ in 0..100_000 {
                    tuple::create(ctx, &[Value::int(1); 4]).unwrap();
                    ctx.checkpoint();
                }
                // a failed assertion panics the fiber and shows up as exit code 101
                assert_eq!(string::to_string(ctx.heap(), keep.get()).as_deref(), Some("still here after the churn"));
                Value::NULL
            })
            .unwrap();
        assert_eq!(report.exit_code, 0, "{} workers", workers);
        assert!(report.gc.collections > 0);
        assert!(report.uncaught.is_empty());
    }
}

#[test]
fn test_pause_completes_while_another_fiber_only_allocates() {
    let config = RuntimeConfig::default().with_workers(3).with_heap_size(32 << 20).with_region_size(64 << 10);
    let runtime = Runtime::new(config).unwrap();
    // tuples of four values that fit in the eden share of the heap
    let eden_tuples = (32 << 20) / 3 / 48;
    let allocated = Arc::new(AtomicUsize::new(0));
    let collections = Arc::new(AtomicUsize::new(0));

    let (allocated_in, collections_in) = (allocated.clone(), collections.clone());
    let report = runtime
        .run(move |ctx| {
            let stop = Arc::new(AtomicBool::new(false));
            let (stop_a, stop_b) = (stop.clone(), stop.clone());
            let allocated = allocated_in.clone();
            let allocator = ctx
                .spawn(move |ctx| {
                    // no explicit checkpoint: allocation is the only poll point
                    while !stop_a.load(Ordering::SeqCst) {
                        tuple::create(ctx, &[Value::int(0); 4]).unwrap();
                        allocated.fetch_add(1, Ordering::SeqCst);
                    }
                    Value::NULL
                })
                .unwrap();
            let collections = collections_in.clone();
            let collector = ctx
                .spawn(move |ctx| {
                    for _ in 0..5 {
                        if ctx.collect_garbage() {
                            collections.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                    stop_b.store(true, Ordering::SeqCst);
                    Value::NULL
                })
                .unwrap();
            ctx.join(&collector);
            ctx.join(&allocator);
            Value::NULL
        })
        .unwrap();

    assert_eq!(report.exit_code, 0);
    assert_eq!(collections.load(Ordering::SeqCst), 5);
    assert!(allocated.load(Ordering::SeqCst) < 2 * eden_tuples, "pauses waited for eden to fill up");
}

#[test]
fn test_collection_inside_fibers_keeps_handles() {
    let runtime = runtime(4);
    let results = Arc::new(Mutex::new(Vec::new()));
    let results_in = results.clone();

    let report = runtime
        .run(move |ctx| {
            let children: Vec<_> = (0..8i64)
                .map(|n| {
                    ctx.spawn(move |ctx| {
                        let expected = format!("payload of fiber number {}", n);
                        let scope = HandleScope::new(ctx.handles());
                        let text = scope.handle(string::create_string(ctx, &expected).unwrap());
                        let pair = scope.handle(tuple::create(ctx, &[text.get(), Value::int(n)]).unwrap());

                        for _ in 0..5 {
                            for _ in 0..50 {
                                tuple::create(ctx, &[Value::int(0); 8]).unwrap();
                            }
                            ctx.collect_garbage();
                            ctx.checkpoint();
                        }

                        let heap = ctx.heap();
                        let moved = tuple::get(heap, pair.get(), 0);
                        let intact = string::to_string(heap, moved).as_deref() == Some(expected.as_str())
                            && tuple::get(heap, pair.get(), 1) == Value::int(n)
                            && text.get() == moved;
                        Value::bool(intact)
                    })
                    .unwrap()
                })
                .collect();
            let joined: Vec<Value> = children.iter().map(|child| ctx.join(child)).collect();
            *results_in.lock() = joined;
            Value::NULL
        })
        .unwrap();

    assert_eq!(report.exit_code, 0);
    assert_eq!(*results.lock(), vec![Value::TRUE; 8]);
    assert!(report.gc.collections >= 1);
    assert_eq!(runtime.live_fibers(), 0);
}

#[test]
fn test_heap_exhaustion_aborts_runtime() {
    let config = RuntimeConfig::default().with_workers(1).with_heap_size(64 << 10).with_region_size(4096);
    let runtime = Runtime::new(config).unwrap();
    let report = runtime
        .run(|ctx| {
            let scope = HandleScope::new(ctx.handles());
            let head = scope.handle(Value::NULL);
            loop {
                let node = tuple::create(ctx, &[head.get(), Value::int(1), Value::int(2), Value::int(3)]).unwrap();
                head.set(node);
            }
        })
        .unwrap();
    assert_eq!(report.exit_code, EXIT_HEAP_EXHAUSTED);
}

#[test]
fn test_exception_carries_message_and_stack() {
    let runtime = runtime(1);
    let observed = Arc::new(Mutex::new(None));
    let observed_in = observed.clone();

    runtime
        .run(move |ctx| {
            let outer = ctx.declare_symbol("outer");
            let inner = ctx.declare_symbol("inner");
            ctx.push_frame(CallFrame { name: outer, ip: 0, self_value: Value::NULL });
            ctx.push_frame(CallFrame { name: inner, ip: 12, self_value: Value::NULL });
            assert_eq!(ctx.stack_trace()[0].name, inner);

            let thrown = ctx.throw_message(format_args!("from {}", "inner"));
            assert!(thrown.is_error_exception());
            let exception = ctx.pending_exception().unwrap();

            let heap = ctx.heap();
            assert_eq!(heap.shape_of(exception), ShapeId::EXCEPTION);
            let message = instance::field_at(heap, exception, exception_fields::MESSAGE);
            let stack = instance::field_at(heap, exception, exception_fields::STACK);
            *observed_in.lock() =
                Some((string::to_string(heap, message), tuple::elements(heap, stack), vec![inner, outer]));

            assert_eq!(ctx.pop_frame().map(|f| f.ip), Some(12));
            ctx.reset_pending_exception();
            Value::NULL
        })
        .unwrap();

    let (message, stack, names) = observed.lock().take().unwrap();
    assert_eq!(message.as_deref(), Some("from inner"));
    assert_eq!(stack, names.into_iter().map(Value::symbol).collect::<Vec<_>>());
}

#[test]
fn test_symbol_values_are_cached_and_survive_collection() {
    let runtime = runtime(1);
    let report = runtime
        .run(|ctx| {
            let symbol = ctx.declare_symbol("a symbol with a long name");
            let first = ctx.lookup_symbol(symbol);
            assert_eq!(ctx.lookup_symbol(symbol), first);

            ctx.collect_garbage();
            let moved = ctx.lookup_symbol(symbol);
            assert_eq!(string::to_string(ctx.heap(), moved).as_deref(), Some("a symbol with a long name"));
            assert_eq!(ctx.declare_symbol("a symbol with a long name"), symbol);
            Value::NULL
        })
        .unwrap();
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.gc.collections, 1);
}

#[test]
fn test_fiber_object_and_native_sections() {
    let runtime = runtime(1);
    let report = runtime
        .run(|ctx| {
            let object = ctx.fiber_object();
            let heap = ctx.heap();
            assert_eq!(heap.shape_of(object), ShapeId::FIBER);
            assert_eq!(instance::field_at(heap, object, fiber_fields::ID), Value::int(ctx.fiber_id() as i64));

            let worker = ctx.worker_index();
            let state = ctx.native(|| ctx.runtime().safepoint().mutators()[worker].0);
            assert_eq!(state, MutatorState::Native);
            assert_eq!(ctx.runtime().safepoint().mutators()[worker].0, MutatorState::Working);
            Value::NULL
        })
        .unwrap();
    assert_eq!(report.exit_code, 0);
}
