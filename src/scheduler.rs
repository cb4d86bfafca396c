//! M:N fiber scheduler.
//!
//! Multiplexes a FIFO of work items (fibers or bare closures, each
//! with an optional thread affinity) onto a fixed pool of worker
//! threads. The constructing thread can opt in as an extra worker
//! with `use_caller`; it then drains work from inside [`Scheduler::stop`]
//! through a dedicated root dispatch fiber.
//!
//! Dispatch order is FIFO with two skips: items pinned to another
//! thread, and fibers currently executing on another worker. No work
//! stealing, no priorities, no preemption.

use crate::error::Error;
use crate::fiber::{Fiber, FiberState};
use crate::thread::{self, Thread};
use crate::tls;
use crate::util;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// The payload of a work item: a fiber to resume or a closure to run
/// on a pooled fiber.
pub enum Work {
    Fiber(Arc<Fiber>),
    Func(Box<dyn FnOnce() + Send + 'static>),
}

/// A queued unit of work plus its thread affinity (-1 = any worker).
pub struct Job {
    work: Work,
    thread: i32,
}

impl Job {
    /// Wraps a fiber handle for scheduling.
    pub fn fiber(fiber: Arc<Fiber>) -> Job {
        Job {
            work: Work::Fiber(fiber),
            thread: -1,
        }
    }

    /// Wraps a closure for scheduling.
    pub fn func(func: impl FnOnce() + Send + 'static) -> Job {
        Job {
            work: Work::Func(Box::new(func)),
            thread: -1,
        }
    }

    /// Pins the job to the worker whose kernel thread id is `thread`.
    pub fn on_thread(mut self, thread: i32) -> Job {
        self.thread = thread;
        self
    }

    /// The job's affinity target, or -1 for any worker.
    pub fn thread(&self) -> i32 {
        self.thread
    }
}

/// Queue and worker bookkeeping guarded by the scheduler mutex.
struct SchedState {
    queue: VecDeque<Job>,
    threads: Vec<Thread>,
    thread_ids: Vec<i32>,
    stopping: bool,
    auto_stop: bool,
}

/// A fixed pool of worker threads draining a shared FIFO of jobs.
pub struct Scheduler {
    name: String,
    state: Mutex<SchedState>,
    /// Worker threads to spawn in `start` (excludes the caller slot).
    thread_count: usize,
    active_threads: AtomicUsize,
    idle_threads: AtomicUsize,
    /// Dispatch fiber for the reused caller thread, if any.
    root_fiber: Option<Arc<Fiber>>,
    /// Kernel id of the reused caller thread, or -1.
    root_thread: i32,
    /// Back-reference for handing out strong handles from `&self`.
    weak_self: Weak<Scheduler>,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers.
    ///
    /// With `use_caller`, the constructing thread counts as one of the
    /// workers: a root dispatch fiber is built around the dispatch
    /// loop and the caller thread drains work when it enters `stop`.
    /// The caller thread must not already be running a scheduler.
    pub fn new(
        threads: usize,
        use_caller: bool,
        name: impl Into<String>,
    ) -> Result<Arc<Scheduler>, Error> {
        if threads == 0 {
            util::fatal("scheduler requires at least one thread");
        }
        let name = name.into();

        let mut thread_ids = Vec::new();
        let (root_fiber, root_thread, thread_count) = if use_caller {
            // Materialize this thread's main fiber before anything
            // can switch away from it.
            Fiber::current();
            if Scheduler::current().is_some() {
                util::fatal("caller thread is already running a scheduler");
            }

            let root = Fiber::new(
                || {
                    if let Some(scheduler) = Scheduler::current() {
                        scheduler.run();
                    }
                },
                0,
                true,
            )?;
            thread::set_name(&name);

            let tid = thread::current_id();
            thread_ids.push(tid);
            (Some(root), tid, threads - 1)
        } else {
            (None, -1, threads)
        };

        let scheduler = Arc::new_cyclic(|weak: &Weak<Scheduler>| Scheduler {
            name,
            state: Mutex::new(SchedState {
                queue: VecDeque::new(),
                threads: Vec::new(),
                thread_ids,
                stopping: true,
                auto_stop: false,
            }),
            thread_count,
            active_threads: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            root_fiber,
            root_thread,
            weak_self: weak.clone(),
        });

        if use_caller {
            tls::set_current_scheduler(Arc::downgrade(&scheduler));
            if let Some(root) = &scheduler.root_fiber {
                tls::set_dispatch_fiber(root);
            }
        }

        Ok(scheduler)
    }

    /// Returns the scheduler the calling thread is executing for.
    pub fn current() -> Option<Arc<Scheduler>> {
        tls::current_scheduler().and_then(|weak| weak.upgrade())
    }

    /// Returns the scheduler name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers currently resuming a job.
    pub fn active_count(&self) -> usize {
        self.active_threads.load(Ordering::SeqCst)
    }

    /// Number of workers parked in their idle fiber.
    pub fn idle_count(&self) -> usize {
        self.idle_threads.load(Ordering::SeqCst)
    }

    /// True if at least one worker is idling.
    pub fn has_idle_threads(&self) -> bool {
        self.idle_count() > 0
    }

    /// Launches the worker threads.
    ///
    /// A second `start` on a running scheduler is a no-op.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if !state.stopping {
            return Ok(());
        }
        state.stopping = false;
        if !state.threads.is_empty() {
            util::fatal("scheduler restarted while workers are still attached");
        }

        for index in 0..self.thread_count {
            let scheduler = match self.weak_self.upgrade() {
                Some(scheduler) => scheduler,
                None => util::fatal("scheduler started without a live handle"),
            };
            let worker = Thread::new(
                move || scheduler.run(),
                format!("{}_{}", self.name, index),
            )?;
            state.thread_ids.push(worker.id());
            state.threads.push(worker);
        }
        Ok(())
    }

    /// Appends a job to the run queue, waking a worker if the queue
    /// was empty.
    pub fn schedule(&self, job: Job) {
        let need_tickle = {
            let mut state = self.state.lock();
            let was_empty = state.queue.is_empty();
            state.queue.push_back(job);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Appends a batch of jobs under one lock acquisition, waking a
    /// worker at most once.
    pub fn schedule_all(&self, jobs: impl IntoIterator<Item = Job>) {
        let need_tickle = {
            let mut state = self.state.lock();
            let was_empty = state.queue.is_empty();
            let mut added = false;
            for job in jobs {
                state.queue.push_back(job);
                added = true;
            }
            was_empty && added
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Stops the scheduler: drains the queue, terminates the idle
    /// fibers, and joins every worker thread. Idempotent; a `stop`
    /// on a never-started scheduler short-circuits.
    ///
    /// With `use_caller` this must run on the constructing thread
    /// (the caller drains work here); otherwise it must come from
    /// outside the scheduler's own workers.
    pub fn stop(&self) {
        self.state.lock().auto_stop = true;

        if let Some(root) = &self.root_fiber {
            if self.thread_count == 0
                && matches!(root.state(), FiberState::Term | FiberState::Init)
            {
                self.state.lock().stopping = true;
                if self.stopping() {
                    return;
                }
            }
        }

        if self.root_thread != -1 {
            if !self.is_current() {
                util::fatal("stop() for a use_caller scheduler must run on its caller thread");
            }
        } else if self.is_current() {
            util::fatal("stop() must come from outside the scheduler's own workers");
        }

        self.state.lock().stopping = true;
        for _ in 0..self.thread_count {
            self.tickle();
        }
        if self.root_fiber.is_some() {
            self.tickle();
        }

        if let Some(root) = &self.root_fiber {
            if !self.stopping() {
                // The caller thread becomes a worker until the queue
                // drains and the root dispatch loop terminates.
                root.call();
            }
        }

        let workers = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.threads)
        };
        for worker in workers {
            if worker.join().is_err() {
                tracing::error!(target: "scheduler", "worker thread panicked");
            }
        }
    }

    /// Migrates the calling fiber onto this scheduler, optionally onto
    /// the worker with kernel thread id `thread`.
    ///
    /// A no-op when already running on this scheduler and either any
    /// thread is acceptable or the current thread matches.
    pub fn switch_to(&self, thread: i32) {
        if self.is_current() && (thread == -1 || thread == thread::current_id()) {
            return;
        }
        self.schedule(Job::fiber(Fiber::current()).on_thread(thread));
        Fiber::yield_to_hold();
    }

    /// Writes one line of scheduler state followed by the worker
    /// thread ids.
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        writeln!(
            out,
            "[Scheduler name={} size={} active_count={} idle_count={} stopping={} ]",
            self.name,
            self.thread_count,
            self.active_threads.load(Ordering::SeqCst),
            self.idle_threads.load(Ordering::SeqCst),
            state.stopping
        )?;
        write!(out, "    ")?;
        for (index, id) in state.thread_ids.iter().enumerate() {
            if index > 0 {
                write!(out, ", ")?;
            }
            write!(out, "{id}")?;
        }
        Ok(())
    }

    fn is_current(&self) -> bool {
        tls::current_scheduler_is(self)
    }

    /// Wake signal delivered when new work arrives or a worker notices
    /// work it cannot take itself.
    ///
    /// The base scheduler spins through its idle fiber, so this is a
    /// no-op. A blocking `idle` (an I/O reactor layer) must pair it
    /// with a mechanism that lets at least one idle worker re-enter
    /// the dispatch loop in bounded time.
    fn tickle(&self) {
        debug!(target: "scheduler", name = %self.name, "tickle");
    }

    /// True once the scheduler may terminate: stop was requested, the
    /// queue is drained, and no worker is resuming a job.
    fn stopping(&self) -> bool {
        let state = self.state.lock();
        state.auto_stop
            && state.stopping
            && state.queue.is_empty()
            && self.active_threads.load(Ordering::SeqCst) == 0
    }

    /// Runs while a worker has nothing to dispatch. Terminates once
    /// [`Scheduler::stopping`] holds, which ends the worker.
    fn idle(&self) {
        debug!(target: "scheduler", name = %self.name, "idle fiber running");
        while !self.stopping() {
            std::thread::yield_now();
            Fiber::yield_to_hold();
        }
    }

    /// The dispatch loop. Every worker thread runs this directly; the
    /// reused caller thread runs it inside the root dispatch fiber.
    fn run(&self) {
        debug!(target: "scheduler", name = %self.name, "dispatch loop starting");
        tls::set_current_scheduler(self.weak_self.clone());
        if thread::current_id() != self.root_thread {
            // Plain workers dispatch from their thread main fiber.
            let main = Fiber::current();
            tls::set_dispatch_fiber(&main);
        }

        let idle_fiber = Fiber::new(
            || {
                if let Some(scheduler) = Scheduler::current() {
                    scheduler.idle();
                }
            },
            0,
            false,
        )
        .unwrap_or_else(|err| util::fatal(&format!("idle fiber allocation failed: {err}")));

        // Reused for closure jobs so each one does not pay for a
        // fresh stack.
        let mut func_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut job = None;
            let mut tickle_me = false;
            let mut is_active = false;
            {
                let mut state = self.state.lock();
                let tid = thread::current_id();
                let mut index = 0;
                while index < state.queue.len() {
                    let item = &state.queue[index];
                    // Someone else's affinity target: leave it, but
                    // make sure another worker gets woken.
                    if item.thread != -1 && item.thread != tid {
                        tickle_me = true;
                        index += 1;
                        continue;
                    }
                    // Already running on another worker.
                    if let Work::Fiber(fiber) = &item.work {
                        if fiber.state() == FiberState::Exec {
                            index += 1;
                            continue;
                        }
                    }
                    job = state.queue.remove(index);
                    self.active_threads.fetch_add(1, Ordering::SeqCst);
                    is_active = true;
                    break;
                }
                tickle_me = tickle_me || index < state.queue.len();
            }

            if tickle_me {
                self.tickle();
            }

            let mut dispatched = false;
            if let Some(job) = job {
                match job.work {
                    Work::Fiber(fiber) => {
                        // Terminal fibers pulled from the queue are
                        // discarded below via the is_active release.
                        if !matches!(fiber.state(), FiberState::Term | FiberState::Except) {
                            fiber.swap_in();
                            self.active_threads.fetch_sub(1, Ordering::SeqCst);
                            if fiber.state() == FiberState::Ready {
                                self.schedule(Job::fiber(fiber));
                            }
                            // HOLD stays with its external holders;
                            // TERM/EXCEPT drop here.
                            dispatched = true;
                        }
                    }
                    Work::Func(func) => {
                        let fiber = match func_fiber.take() {
                            Some(fiber) => {
                                fiber.reset(func);
                                fiber
                            }
                            None => Fiber::new(func, 0, false).unwrap_or_else(|err| {
                                util::fatal(&format!("work fiber allocation failed: {err}"))
                            }),
                        };
                        fiber.swap_in();
                        self.active_threads.fetch_sub(1, Ordering::SeqCst);
                        match fiber.state() {
                            FiberState::Ready => self.schedule(Job::fiber(fiber)),
                            // Settled: keep the fiber for the next
                            // closure job.
                            FiberState::Term | FiberState::Except => func_fiber = Some(fiber),
                            // HOLD: ownership moved to whoever will
                            // reschedule it.
                            _ => {}
                        }
                        dispatched = true;
                    }
                }
            }

            if !dispatched {
                if is_active {
                    self.active_threads.fetch_sub(1, Ordering::SeqCst);
                    continue;
                }
                if idle_fiber.state() == FiberState::Term {
                    info!(target: "scheduler", name = %self.name, "idle fiber terminated");
                    break;
                }
                self.idle_threads.fetch_add(1, Ordering::SeqCst);
                idle_fiber.swap_in();
                self.idle_threads.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if !self.state.get_mut().stopping {
            util::fatal("scheduler dropped while running");
        }
        if tls::current_scheduler_is(self) {
            tls::clear_current_scheduler();
        }
    }
}

/// Scoped migration to another scheduler.
///
/// Construction switches the current fiber onto `target` (if given);
/// dropping the guard switches back to the scheduler that was current
/// when the guard was created.
pub struct SchedulerSwitcher {
    caller: Option<Arc<Scheduler>>,
}

impl SchedulerSwitcher {
    pub fn new(target: Option<&Arc<Scheduler>>) -> SchedulerSwitcher {
        let caller = Scheduler::current();
        if let Some(target) = target {
            target.switch_to(-1);
        }
        SchedulerSwitcher { caller }
    }
}

impl Drop for SchedulerSwitcher {
    fn drop(&mut self) {
        if let Some(caller) = &self.caller {
            caller.switch_to(-1);
        }
    }
}
