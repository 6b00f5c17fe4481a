//! Counting semaphore

use parking_lot::{Condvar, Mutex};

/// Counting semaphore that parks fibers while no permit is available.
#[derive(Debug, Default)]
pub struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    /// Create a semaphore holding `permits` permits
    pub fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    /// Take one permit, parking until one is released
    pub fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

    /// Take one permit if available without parking
    pub fn try_acquire(&self) -> bool {
        let mut permits = self.permits.lock();
        if *permits == 0 {
            return false;
        }
        *permits -= 1;
        true
    }

    /// Return one permit and wake one waiter
    pub fn release(&self) {
        *self.permits.lock() += 1;
        self.cond.notify_one();
    }

    /// Get the current number of available permits
    pub fn available_permits(&self) -> usize {
        *self.permits.lock()
    }
}
