//! Stackful fibers with explicit yield and resume.
//!
//! A fiber owns a stack and a saved machine context; switching is done
//! through `corosensei` coroutines. Every OS thread lazily gets a
//! *main* fiber wrapping its native stack; all other fibers are *sub*
//! fibers created with [`Fiber::new`]. A suspended coroutine always
//! returns control to its resumer, so the `call`/`back` and
//! `swap_in`/`swap_out` pairs differ in which thread-local slot is
//! republished as the current fiber, not in which context is saved.

use crate::config::{self, ConfigVar};
use crate::error::Error;
use crate::tls;
use crate::util;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::cell::UnsafeCell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

lazy_static::lazy_static! {
    static ref FIBER_STACK_SIZE: Arc<ConfigVar<usize>> =
        config::lookup("fiber.stack_size", 128 * 1024, "fiber stack size");
}

/// Lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Constructed or reset, never resumed since.
    Init = 0,
    /// Yielded and eligible for re-dispatch.
    Ready = 1,
    /// Currently executing on some thread.
    Exec = 2,
    /// Yielded; waits for an external reschedule.
    Hold = 3,
    /// Entry closure returned.
    Term = 4,
    /// Entry closure panicked.
    Except = 5,
}

impl FiberState {
    fn from_u8(raw: u8) -> FiberState {
        match raw {
            0 => FiberState::Init,
            1 => FiberState::Ready,
            2 => FiberState::Exec,
            3 => FiberState::Hold,
            4 => FiberState::Term,
            _ => FiberState::Except,
        }
    }

    /// True for the states a sub-fiber may be destroyed or reset in.
    fn is_settled(self) -> bool {
        matches!(
            self,
            FiberState::Init | FiberState::Term | FiberState::Except
        )
    }
}

/// Next-state requested by a cooperative yield.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Hold,
    Ready,
}

impl From<Disposition> for FiberState {
    fn from(disposition: Disposition) -> FiberState {
        match disposition {
            Disposition::Hold => FiberState::Hold,
            Disposition::Ready => FiberState::Ready,
        }
    }
}

/// Where control is handed when this fiber suspends or completes:
/// back to the thread's main fiber, or to the scheduler's dispatch
/// fiber on this thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnTo {
    Dispatch,
    ThreadMain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FiberKind {
    /// Wraps the thread's native stack; cannot be resumed or yielded.
    Main,
    /// Owns a heap-allocated stack.
    Sub,
}

type EntryFn = Box<dyn FnOnce() + Send + 'static>;
type FiberCoroutine = Coroutine<(), Disposition, ()>;

/// A stackful user-space coroutine.
///
/// Handles are shared; the fiber lives until the last holder drops it.
/// The queue, the dispatch loop, and user code may all hold one.
pub struct Fiber {
    id: u64,
    stack_size: usize,
    kind: FiberKind,
    return_to: ReturnTo,
    state: AtomicU8,
    /// Back-reference for handing out strong handles from `&self`.
    weak_self: Weak<Fiber>,
    coroutine: UnsafeCell<Option<FiberCoroutine>>,
    func: UnsafeCell<Option<EntryFn>>,
    yielder: AtomicPtr<Yielder<(), Disposition>>,
}

// SAFETY: a fiber's coroutine and entry closure are touched only by
// the thread that holds it in EXEC, and the dispatch scan refuses to
// hand an EXEC fiber to a second worker while holding the queue lock.
// State is atomic; the remaining fields are immutable after creation.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a sub-fiber running `func` on its own stack.
    ///
    /// A `stack_size` of 0 uses the configured `fiber.stack_size`
    /// default. `use_caller` selects the return protocol: `false`
    /// pairs the fiber with the scheduler's dispatch fiber
    /// (`swap_in`/`swap_out`), `true` with the thread's main fiber
    /// (`call`/`back`).
    pub fn new(
        func: impl FnOnce() + Send + 'static,
        stack_size: usize,
        use_caller: bool,
    ) -> Result<Arc<Fiber>, Error> {
        let stack_size = if stack_size == 0 {
            FIBER_STACK_SIZE.get()
        } else {
            stack_size
        };
        let stack = DefaultStack::new(stack_size).map_err(|source| Error::StackAlloc {
            size: stack_size,
            source,
        })?;

        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1;
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        let fiber = Arc::new_cyclic(|weak: &Weak<Fiber>| {
            let entry = weak.clone();
            Fiber {
                id,
                stack_size,
                kind: FiberKind::Sub,
                return_to: if use_caller {
                    ReturnTo::ThreadMain
                } else {
                    ReturnTo::Dispatch
                },
                state: AtomicU8::new(FiberState::Init as u8),
                weak_self: weak.clone(),
                coroutine: UnsafeCell::new(Some(Coroutine::with_stack(
                    stack,
                    move |yielder, ()| Fiber::trampoline(&entry, yielder),
                ))),
                func: UnsafeCell::new(Some(Box::new(func))),
                yielder: AtomicPtr::new(std::ptr::null_mut()),
            }
        });

        debug!(target: "system", id, stack_size, "fiber created");
        Ok(fiber)
    }

    /// Builds the main fiber for the calling thread.
    fn new_main() -> Fiber {
        let id = NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed) + 1;
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        debug!(target: "system", id, "main fiber created");

        Fiber {
            id,
            stack_size: 0,
            kind: FiberKind::Main,
            return_to: ReturnTo::ThreadMain,
            state: AtomicU8::new(FiberState::Exec as u8),
            weak_self: Weak::new(),
            coroutine: UnsafeCell::new(None),
            func: UnsafeCell::new(None),
            yielder: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Returns the fiber id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> FiberState {
        FiberState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Returns the stack size in bytes (0 for a main fiber).
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn is_main(&self) -> bool {
        self.kind == FiberKind::Main
    }

    /// Replaces the entry closure of a settled sub-fiber and
    /// re-initializes its context on the existing stack allocation.
    pub fn reset(&self, func: impl FnOnce() + Send + 'static) {
        if self.kind != FiberKind::Sub {
            util::fatal("reset() on a thread main fiber");
        }
        if !self.state().is_settled() {
            util::fatal(&format!(
                "reset() on fiber {} in state {:?}",
                self.id,
                self.state()
            ));
        }

        // SAFETY: a settled fiber is not executing anywhere, and the
        // resumer protocol gives the caller exclusive access.
        let slot = unsafe { &mut *self.coroutine.get() };
        let stack = match slot.take() {
            Some(coroutine) => coroutine.into_stack(),
            None => util::fatal("reset() on a fiber without a context"),
        };
        let entry = self.weak_self.clone();
        *slot = Some(Coroutine::with_stack(stack, move |yielder, ()| {
            Fiber::trampoline(&entry, yielder)
        }));
        unsafe {
            *self.func.get() = Some(Box::new(func));
        }
        self.set_state(FiberState::Init);
    }

    /// Resumes this fiber from the thread's main fiber.
    ///
    /// Pairs with [`Fiber::back`]: when the fiber suspends or
    /// completes, the main fiber becomes current again.
    pub fn call(&self) {
        let current = Fiber::current();
        if !current.is_main() {
            util::fatal("call() must be entered from the thread's main fiber");
        }
        drop(current);
        self.resume();
    }

    /// Suspends this fiber, handing control back to the fiber that
    /// entered it via [`Fiber::call`]. The fiber is left in HOLD.
    pub fn back(&self) {
        self.suspend_current("back");
    }

    /// Resumes this fiber from the scheduler's dispatch fiber.
    pub fn swap_in(&self) {
        self.resume();
    }

    /// Suspends this fiber, handing control back to the dispatch
    /// fiber. The fiber is left in HOLD.
    pub fn swap_out(&self) {
        self.suspend_current("swap_out");
    }

    fn resume(&self) {
        if self.state() == FiberState::Exec {
            util::fatal(&format!("fiber {} resumed while executing", self.id));
        }
        // SAFETY: the fiber is not in EXEC, so no other thread is
        // inside this coroutine; the dispatch scan guarantees a single
        // resumer (skip-if-EXEC under the queue lock).
        let coroutine = match unsafe { &mut *self.coroutine.get() } {
            Some(coroutine) => coroutine,
            None => util::fatal("a thread main fiber cannot be resumed"),
        };

        let this = match self.weak_self.upgrade() {
            Some(fiber) => fiber,
            None => util::fatal("fiber resumed without a live handle"),
        };
        tls::set_current_fiber(Some(&this));
        drop(this);
        self.set_state(FiberState::Exec);

        match coroutine.resume(()) {
            CoroutineResult::Yield(disposition) => self.set_state(disposition.into()),
            // Completion: the trampoline already settled TERM/EXCEPT.
            CoroutineResult::Return(()) => {}
        }

        // Hand the current-fiber slot back to whichever fiber drives
        // this one.
        let driver = match self.return_to {
            ReturnTo::ThreadMain => tls::thread_main_fiber(),
            ReturnTo::Dispatch => tls::dispatch_fiber().or_else(tls::thread_main_fiber),
        };
        tls::set_current_fiber(driver.as_ref());
    }

    fn suspend_current(&self, op: &str) {
        let executing = tls::current_fiber();
        let is_current = executing
            .as_ref()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(current), self));
        if !is_current || self.state() != FiberState::Exec {
            util::fatal(&format!(
                "{op}() on fiber {} which is not executing here",
                self.id
            ));
        }
        drop(executing);
        Fiber::suspend(Disposition::Hold);
    }

    /// Single entry point for every sub-fiber.
    ///
    /// Runs the entry closure with panic isolation, settles the final
    /// state, then returns to the resumer.
    fn trampoline(entry: &Weak<Fiber>, yielder: &Yielder<(), Disposition>) {
        let current = match entry.upgrade() {
            Some(fiber) => fiber,
            None => util::fatal("fiber entered without a live handle"),
        };
        current
            .yielder
            .store(yielder as *const _ as *mut _, Ordering::Release);

        // SAFETY: this thread holds the fiber in EXEC.
        let func = match unsafe { (*current.func.get()).take() } {
            Some(func) => func,
            None => util::fatal("fiber entered without an entry closure"),
        };

        match panic::catch_unwind(AssertUnwindSafe(func)) {
            Ok(()) => current.set_state(FiberState::Term),
            Err(payload) => {
                current.set_state(FiberState::Except);
                let message = panic_message(payload.as_ref());
                error!(
                    target: "system",
                    fiber_id = current.id,
                    "fiber panicked: {message}\nbacktrace:\n{}",
                    util::backtrace_to_string(64, 2, "    ")
                );
            }
        }

        current
            .yielder
            .store(std::ptr::null_mut(), Ordering::Release);
        // The strong handle must not outlive the final switch.
        drop(current);
    }

    /// Returns the calling thread's current fiber, creating the
    /// thread's main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(fiber) = tls::current_fiber() {
            return fiber;
        }
        let main = Arc::new_cyclic(|weak: &Weak<Fiber>| {
            let mut fiber = Fiber::new_main();
            fiber.weak_self = weak.clone();
            fiber
        });
        tls::set_current_fiber(Some(&main));
        tls::set_thread_main_fiber(main.clone());
        main
    }

    /// Publishes `fiber` as the calling thread's current fiber.
    ///
    /// Low-level hook; the resume and suspend paths maintain this slot
    /// themselves.
    pub fn set_current(fiber: &Arc<Fiber>) {
        tls::set_current_fiber(Some(fiber));
    }

    /// Suspends the current fiber in HOLD; it will run again only when
    /// a holder re-schedules it.
    pub fn yield_to_hold() {
        Fiber::suspend(Disposition::Hold);
    }

    /// Suspends the current fiber in READY; the dispatch loop
    /// re-enqueues it at the tail of the run queue.
    pub fn yield_to_ready() {
        Fiber::suspend(Disposition::Ready);
    }

    fn suspend(disposition: Disposition) {
        let current = match tls::current_fiber() {
            Some(fiber) => fiber,
            None => util::fatal("yield without a current fiber"),
        };
        if current.state() != FiberState::Exec {
            util::fatal(&format!(
                "yield from fiber {} in state {:?}",
                current.id,
                current.state()
            ));
        }
        let yielder = current.yielder.load(Ordering::Acquire);
        if yielder.is_null() {
            util::fatal("a thread main fiber cannot yield");
        }
        drop(current);
        // SAFETY: a non-null yielder means this thread is inside the
        // coroutine body, where the yielder reference is live.
        unsafe {
            (*yielder).suspend(disposition);
        }
    }

    /// Number of live fibers across the process.
    pub fn total_fibers() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    /// Id of the calling thread's current fiber, or 0 if none exists.
    pub fn current_id() -> u64 {
        tls::current_fiber().map_or(0, |fiber| fiber.id)
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        match self.kind {
            FiberKind::Sub => {
                if !self.state().is_settled() {
                    util::fatal(&format!(
                        "fiber {} destroyed in state {:?}",
                        self.id,
                        self.state()
                    ));
                }
            }
            FiberKind::Main => {
                if self.state() != FiberState::Exec || unsafe { (*self.func.get()).is_some() } {
                    util::fatal("main fiber destroyed while not cleanly executing");
                }
                if tls::current_fiber_is(self) {
                    tls::clear_current_fiber();
                }
            }
        }
        debug!(
            target: "system",
            id = self.id,
            total = FIBER_COUNT.load(Ordering::Relaxed),
            "fiber destroyed"
        );
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let a = Fiber::new(|| {}, 16 * 1024, false).unwrap();
        let b = Fiber::new(|| {}, 16 * 1024, false).unwrap();
        assert!(b.id() > a.id());
        assert_eq!(a.state(), FiberState::Init);
        assert_eq!(b.state(), FiberState::Init);
    }

    #[test]
    fn test_zero_stack_size_uses_config_default() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        assert_eq!(fiber.stack_size(), 128 * 1024);
    }

    #[test]
    fn test_current_creates_main_fiber() {
        let main = Fiber::current();
        assert_eq!(main.state(), FiberState::Exec);
        assert_eq!(main.stack_size(), 0);
        assert_eq!(Fiber::current_id(), main.id());
        assert!(Arc::ptr_eq(&main, &Fiber::current()));
    }

}
