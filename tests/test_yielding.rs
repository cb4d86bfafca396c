//! Cooperative yield semantics under the scheduler.

use spindle::{Fiber, FiberState, Job, Scheduler};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[test]
fn test_fifo_order_on_single_worker() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let scheduler = Scheduler::new(1, false, "fifo").unwrap();

    for name in ["c1", "c2", "c3"] {
        let order = order.clone();
        scheduler.schedule(Job::func(move || {
            order.lock().unwrap().push(name);
        }));
    }

    scheduler.start().unwrap();
    scheduler.stop();

    assert_eq!(*order.lock().unwrap(), vec!["c1", "c2", "c3"]);
}

#[test]
fn test_ready_yield_interleaves_on_single_worker() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let scheduler = Scheduler::new(1, false, "interleave").unwrap();

    let mut fibers = Vec::new();
    for name in ["a", "b"] {
        let trace = trace.clone();
        let fiber = Fiber::new(
            move || {
                for _ in 0..3 {
                    trace.lock().unwrap().push(name);
                    Fiber::yield_to_ready();
                }
            },
            0,
            false,
        )
        .unwrap();
        scheduler.schedule(Job::fiber(fiber.clone()));
        fibers.push(fiber);
    }

    scheduler.start().unwrap();
    scheduler.stop();

    // One worker plus tail re-enqueue of READY fibers gives strict
    // alternation.
    assert_eq!(*trace.lock().unwrap(), vec!["a", "b", "a", "b", "a", "b"]);
    for fiber in &fibers {
        assert_eq!(fiber.state(), FiberState::Term);
    }
}

#[test]
fn test_hold_waits_for_external_reschedule() {
    let trace = Arc::new(Mutex::new(Vec::new()));
    let scheduler = Scheduler::new(1, false, "hold").unwrap();
    scheduler.start().unwrap();

    let trace_clone = trace.clone();
    let fiber = Fiber::new(
        move || {
            trace_clone.lock().unwrap().push("before");
            Fiber::yield_to_hold();
            trace_clone.lock().unwrap().push("after");
        },
        0,
        false,
    )
    .unwrap();
    scheduler.schedule(Job::fiber(fiber.clone()));

    while fiber.state() != FiberState::Hold {
        std::thread::sleep(Duration::from_millis(1));
    }
    // A HOLD fiber is not re-enqueued by the dispatcher.
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(*trace.lock().unwrap(), vec!["before"]);

    scheduler.schedule(Job::fiber(fiber.clone()));
    scheduler.stop();

    assert_eq!(*trace.lock().unwrap(), vec!["before", "after"]);
    assert_eq!(fiber.state(), FiberState::Term);
}

#[test]
fn test_hold_cycles_repeat_identically() {
    let scheduler = Scheduler::new(1, false, "hold_cycle").unwrap();
    scheduler.start().unwrap();

    let fiber = Fiber::new(
        || {
            for _ in 0..4 {
                let scheduler = Scheduler::current().unwrap();
                scheduler.schedule(Job::fiber(Fiber::current()));
                Fiber::yield_to_hold();
            }
        },
        0,
        false,
    )
    .unwrap();
    scheduler.schedule(Job::fiber(fiber.clone()));

    scheduler.stop();
    assert_eq!(fiber.state(), FiberState::Term);
}
