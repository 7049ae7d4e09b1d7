//! Fibers parked on one key are woken in arrival order.

use std::sync::Arc;

use kiln_vm::{Park, Runtime, RuntimeConfig, Value};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;

const WAITERS: usize = 5;
const KEY: usize = 0x5eed_0000;

#[test]
fn test_unpark_one_wakes_in_fifo_order() {
    let runtime = Runtime::new(RuntimeConfig::default().with_workers(1)).unwrap();
    let spawned = Arc::new(Mutex::new(Vec::new()));
    let woken = Arc::new(Mutex::new(Vec::new()));
    let ran = Arc::new(Mutex::new(Vec::new()));

    let (spawned_in, woken_in, ran_in) = (spawned.clone(), woken.clone(), ran.clone());
    let report = runtime
        .run(move |ctx| {
            let lot = ctx.parking_lot();
            let mut children = Vec::new();
            for i in 0..WAITERS {
                let ran = ran_in.clone();
                let child = ctx
                    .spawn(move |ctx| {
                        ctx.park(KEY, &mut || true);
                        ran.lock().push(ctx.fiber_id());
                        Value::NULL
                    })
                    .unwrap();
                spawned_in.lock().push(child.id());
                // make sure the child is queued before spawning the next one
                while lot.waiter_count(KEY) < i + 1 {
                    ctx.yield_to_scheduler();
                }
                children.push(child);
            }

            for i in 0..WAITERS {
                let result = lot.unpark_one(KEY, |_| {});
                assert_eq!(result.have_more, i + 1 < WAITERS);
                woken_in.lock().extend(result.unparked);
            }
            for child in &children {
                ctx.join(child);
            }
            Value::NULL
        })
        .unwrap();

    assert_eq!(report.exit_code, 0);
    let spawned = spawned.lock().clone();
    assert_eq!(spawned.len(), WAITERS);
    assert_eq!(*woken.lock(), spawned);
    assert_eq!(*ran.lock(), spawned);
}

#[test]
fn test_failed_validation_does_not_suspend() {
    let runtime = Runtime::new(RuntimeConfig::default().with_workers(1)).unwrap();
    let report = runtime
        .run(|ctx| {
            let parked = ctx.park(KEY, &mut || false);
            Value::bool(parked)
        })
        .unwrap();
    assert_eq!(report.exit_code, 0);
}
