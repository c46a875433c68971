use std::sync::{Condvar, Mutex};

/// Counting semaphore. `exit` signals it, `join` waits on it; resource
/// release always happens before the signal, so a woken waiter never sees a
/// half-torn-down process.
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Waits for a unit and consumes it.
    pub fn p(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.available.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Releases one unit, waking a waiter if any.
    pub fn v(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.available.notify_one();
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &*self.count.lock().unwrap())
            .finish()
    }
}
