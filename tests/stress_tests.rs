//! Soak: many yielding fibers across several worker counts, with the
//! live-fiber census checked after every drain.
//!
//! Kept as the single test in this binary so the process-wide fiber
//! count is not perturbed by concurrent tests.

use spindle::{Fiber, FiberState, Job, Scheduler};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const FIBERS: usize = 200;
const YIELDS: usize = 50;

#[test]
fn test_soak_yield_cycles_across_worker_counts() {
    let _main = Fiber::current();
    let baseline = Fiber::total_fibers();

    for &workers in &[1usize, 2, 4] {
        let done = Arc::new(AtomicUsize::new(0));
        let scheduler = Scheduler::new(workers, false, format!("soak_{workers}")).unwrap();
        scheduler.start().unwrap();

        let fibers: Vec<_> = (0..FIBERS)
            .map(|_| {
                let done = done.clone();
                Fiber::new(
                    move || {
                        for _ in 0..YIELDS {
                            Fiber::yield_to_ready();
                        }
                        done.fetch_add(1, Ordering::SeqCst);
                    },
                    16 * 1024,
                    false,
                )
                .unwrap()
            })
            .collect();

        scheduler.schedule_all(fibers.iter().cloned().map(Job::fiber));

        while done.load(Ordering::SeqCst) < FIBERS {
            std::thread::sleep(Duration::from_millis(1));
        }
        scheduler.stop();

        for fiber in &fibers {
            assert_eq!(fiber.state(), FiberState::Term);
        }
        drop(fibers);
        drop(scheduler);

        // Workers are joined, their main and idle fibers are gone:
        // constructions equal destructions.
        assert_eq!(Fiber::total_fibers(), baseline);
    }
}
