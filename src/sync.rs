//! Counting semaphore used for launch handshakes.

use parking_lot::{Condvar, Mutex};

/// A counting semaphore with `wait`/`notify` semantics.
///
/// The thread primitive uses one to block a spawning thread until the
/// spawned thread has published its id and name.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `count` permits.
    pub fn new(count: usize) -> Self {
        Semaphore {
            count: Mutex::new(count),
            available: Condvar::new(),
        }
    }

    /// Blocks until a permit is available, then takes it.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.available.wait(&mut count);
        }
        *count -= 1;
    }

    /// Releases one permit, waking a single waiter.
    pub fn notify(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.available.notify_one();
    }
}
