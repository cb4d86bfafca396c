//! OS thread wrapper with a synchronized launch handshake.
//!
//! `Thread::new` does not return until the spawned thread has published
//! its kernel thread id and name into thread-local storage, so a
//! freshly constructed `Thread` always reports a valid [`Thread::id`].
//! The scheduler relies on this to record worker ids before any work
//! item can name one as an affinity target.

use crate::error::Error;
use crate::sync::Semaphore;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::error;

const DEFAULT_NAME: &str = "unknown";

thread_local! {
    static THREAD_ID: Cell<i32> = const { Cell::new(-1) };
    static THREAD_NAME: RefCell<String> = RefCell::new(String::from(DEFAULT_NAME));
}

/// Returns the kernel thread id of the calling thread.
///
/// The id is fetched once per thread via `gettid` and cached.
pub fn current_id() -> i32 {
    THREAD_ID.with(|id| {
        let mut tid = id.get();
        if tid == -1 {
            // SAFETY: gettid takes no arguments and cannot fail.
            tid = unsafe { libc::syscall(libc::SYS_gettid) as i32 };
            id.set(tid);
        }
        tid
    })
}

/// Returns the calling thread's published name.
pub fn current_name() -> String {
    THREAD_NAME.with(|name| name.borrow().clone())
}

/// Publishes `name` for the calling thread.
///
/// Also applies it as the OS-visible thread name, truncated to the
/// 15-byte kernel limit. Empty names are ignored.
pub fn set_name(name: &str) {
    if name.is_empty() {
        return;
    }
    THREAD_NAME.with(|current| *current.borrow_mut() = name.to_string());

    let truncated: String = name.chars().take(15).collect();
    if let Ok(cname) = std::ffi::CString::new(truncated) {
        // SAFETY: pthread_self is the calling thread and cname is a
        // valid NUL-terminated string shorter than 16 bytes.
        unsafe {
            libc::pthread_setname_np(libc::pthread_self(), cname.as_ptr());
        }
    }
}

/// A named OS thread whose id is known as soon as `new` returns.
pub struct Thread {
    id: i32,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Spawns a thread running `f` under `name`.
    ///
    /// Blocks until the thread has published its id and name; the
    /// closure itself starts only after the handshake completes.
    pub fn new(f: impl FnOnce() + Send + 'static, name: impl Into<String>) -> Result<Thread, Error> {
        let mut name = name.into();
        if name.is_empty() {
            name = DEFAULT_NAME.to_string();
        }

        let launched = Arc::new(Semaphore::new(0));
        let published_id = Arc::new(AtomicI32::new(-1));

        let thread_name = name.clone();
        let thread_launched = launched.clone();
        let thread_id = published_id.clone();
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                set_name(&thread_name);
                thread_id.store(current_id(), Ordering::Release);
                thread_launched.notify();
                f();
            })
            .map_err(|source| {
                error!(target: "system", "thread spawn failed, name={name}");
                Error::ThreadSpawn {
                    name: name.clone(),
                    source,
                }
            })?;

        launched.wait();
        Ok(Thread {
            id: published_id.load(Ordering::Acquire),
            name,
            handle: Some(handle),
        })
    }

    /// Returns the kernel thread id.
    pub fn id(&self) -> i32 {
        self.id
    }

    /// Returns the thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the thread to finish.
    pub fn join(mut self) -> std::thread::Result<()> {
        match self.handle.take() {
            Some(handle) => handle.join(),
            None => Ok(()),
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // An unjoined thread is detached, mirroring pthread_detach.
        drop(self.handle.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_id_is_published_before_new_returns() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        let thread = Thread::new(
            move || {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            },
            "test_worker",
        )
        .unwrap();

        assert!(thread.id() > 0);
        assert_eq!(thread.name(), "test_worker");
        thread.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_name_published_in_thread() {
        let thread = Thread::new(
            || {
                assert_eq!(current_name(), "named_thread");
                assert_eq!(current_id(), current_id());
            },
            "named_thread",
        )
        .unwrap();
        thread.join().unwrap();
    }

    #[test]
    fn test_empty_name_gets_default() {
        let thread = Thread::new(|| {}, "").unwrap();
        assert_eq!(thread.name(), "unknown");
        thread.join().unwrap();
    }
}
