//! One-shot completion event

use parking_lot::{Condvar, Mutex};

/// Event that fires exactly once and stays fired.
///
/// Waiting before the event is set parks the caller; waiting after it is set
/// returns immediately.
#[derive(Debug, Default)]
pub struct Event {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    /// Create an unfired event
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an event that has already fired
    pub fn fired() -> Self {
        Self {
            fired: Mutex::new(true),
            cond: Condvar::new(),
        }
    }

    /// Fire the event, waking every waiter.
    ///
    /// Returns `false` if it had already fired.
    pub fn set(&self) -> bool {
        let mut fired = self.fired.lock();
        if *fired {
            return false;
        }
        *fired = true;
        self.cond.notify_all();
        true
    }

    /// Park until the event fires
    pub fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.cond.wait(&mut fired);
        }
    }

    /// Check whether the event has fired
    pub fn is_set(&self) -> bool {
        *self.fired.lock()
    }
}
