//! Per-thread registry of the execution roles on this thread.
//!
//! Replaces implicit global state with four documented slots:
//!
//! - the fiber currently in EXEC (weak; the queue and callers own it),
//! - the thread's main fiber (strong; lives as long as the thread),
//! - the scheduler this thread is running for (weak),
//! - the dispatch fiber driving the scheduler loop on this thread
//!   (weak; equals the main fiber on plain workers, the root fiber on
//!   a reused caller thread).
//!
//! All slots are read and written only by their owning thread.

use crate::fiber::Fiber;
use crate::scheduler::Scheduler;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

thread_local! {
    static CURRENT_FIBER: RefCell<Option<Weak<Fiber>>> = const { RefCell::new(None) };
    static THREAD_MAIN_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };
    static DISPATCH_FIBER: RefCell<Option<Weak<Fiber>>> = const { RefCell::new(None) };
}

pub(crate) fn current_fiber() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade))
}

pub(crate) fn set_current_fiber(fiber: Option<&Arc<Fiber>>) {
    CURRENT_FIBER.with(|slot| *slot.borrow_mut() = fiber.map(Arc::downgrade));
}

/// True if the slot currently names `fiber`, without upgrading.
///
/// Usable from `Fiber::drop`, where the strong count is already zero.
pub(crate) fn current_fiber_is(fiber: *const Fiber) -> bool {
    CURRENT_FIBER
        .try_with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), fiber))
        })
        .unwrap_or(false)
}

pub(crate) fn clear_current_fiber() {
    let _ = CURRENT_FIBER.try_with(|slot| *slot.borrow_mut() = None);
}

pub(crate) fn thread_main_fiber() -> Option<Arc<Fiber>> {
    THREAD_MAIN_FIBER.with(|slot| slot.borrow().clone())
}

pub(crate) fn set_thread_main_fiber(fiber: Arc<Fiber>) {
    THREAD_MAIN_FIBER.with(|slot| *slot.borrow_mut() = Some(fiber));
}

pub(crate) fn current_scheduler() -> Option<Weak<Scheduler>> {
    CURRENT_SCHEDULER.with(|slot| slot.borrow().clone())
}

pub(crate) fn set_current_scheduler(scheduler: Weak<Scheduler>) {
    CURRENT_SCHEDULER.with(|slot| *slot.borrow_mut() = Some(scheduler));
}

pub(crate) fn current_scheduler_is(scheduler: *const Scheduler) -> bool {
    CURRENT_SCHEDULER
        .try_with(|slot| {
            slot.borrow()
                .as_ref()
                .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), scheduler))
        })
        .unwrap_or(false)
}

pub(crate) fn clear_current_scheduler() {
    let _ = CURRENT_SCHEDULER.try_with(|slot| *slot.borrow_mut() = None);
}

pub(crate) fn dispatch_fiber() -> Option<Arc<Fiber>> {
    DISPATCH_FIBER.with(|slot| slot.borrow().as_ref().and_then(Weak::upgrade))
}

pub(crate) fn set_dispatch_fiber(fiber: &Arc<Fiber>) {
    DISPATCH_FIBER.with(|slot| *slot.borrow_mut() = Some(Arc::downgrade(fiber)));
}
