//! Stop-path edge cases: never-started schedulers, repeated stops,
//! and drain guarantees.

use spindle::{Fiber, FiberState, Job, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn test_stop_on_never_started_scheduler() {
    let scheduler = Scheduler::new(2, false, "never_started").unwrap();
    scheduler.stop();
}

#[test]
fn test_stop_on_never_started_use_caller_scheduler() {
    let scheduler = Scheduler::new(1, true, "never_started_caller").unwrap();
    scheduler.stop();
}

#[test]
fn test_stop_is_idempotent() {
    let scheduler = Scheduler::new(2, false, "double_stop").unwrap();
    scheduler.start().unwrap();
    scheduler.stop();
    scheduler.stop();
}

#[test]
fn test_stop_drains_pending_work() {
    let ran = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::new(2, false, "drain").unwrap();
    scheduler.start().unwrap();

    for _ in 0..50 {
        let ran = ran.clone();
        scheduler.schedule(Job::func(move || {
            std::thread::sleep(Duration::from_millis(1));
            ran.fetch_add(1, Ordering::SeqCst);
        }));
    }

    // Stop without waiting; every submitted closure must still run
    // exactly once before stop returns.
    scheduler.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 50);
}

#[test]
fn test_stop_drains_scheduled_fibers() {
    let scheduler = Scheduler::new(1, true, "drain_fibers").unwrap();
    scheduler.start().unwrap();

    let mut fibers = Vec::new();
    for _ in 0..10 {
        let fiber = Fiber::new(
            || {
                Fiber::yield_to_ready();
            },
            0,
            false,
        )
        .unwrap();
        scheduler.schedule(Job::fiber(fiber.clone()));
        fibers.push(fiber);
    }

    scheduler.stop();
    for fiber in &fibers {
        assert_eq!(fiber.state(), FiberState::Term);
    }
}

#[test]
fn test_restart_after_stop() {
    let ran = Arc::new(AtomicUsize::new(0));
    let scheduler = Scheduler::new(1, false, "restart").unwrap();

    scheduler.start().unwrap();
    let first = ran.clone();
    scheduler.schedule(Job::func(move || {
        first.fetch_add(1, Ordering::SeqCst);
    }));
    scheduler.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 1);

    scheduler.start().unwrap();
    let second = ran.clone();
    scheduler.schedule(Job::func(move || {
        second.fetch_add(1, Ordering::SeqCst);
    }));
    scheduler.stop();
    assert_eq!(ran.load(Ordering::SeqCst), 2);
}
