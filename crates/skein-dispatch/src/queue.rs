//! Blocking FIFO of task references
//!
//! Any number of fibers append, any number of worker fibers consume. A
//! consumer parks while the queue is empty; once the queue is terminated,
//! consumers drain what is left and then receive `None`.

use crate::error::UsageError;
use crate::task::TaskRef;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use tracing::{trace, warn};

#[derive(Default)]
struct QueueState {
    pending: VecDeque<TaskRef>,
    terminated: bool,
}

/// Multi-producer, multi-consumer task queue.
#[derive(Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl TaskQueue {
    /// Create an empty, open queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task to the back of the queue and wake one consumer
    pub fn append(&self, task: TaskRef) -> Result<(), UsageError> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(UsageError::QueueTerminated);
        }
        trace!(task = %task.id(), depth = state.pending.len() + 1, "task queued");
        state.pending.push_back(task);
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    /// Take the next task, parking while the queue is empty.
    ///
    /// Returns `None` only once the queue is terminated and drained.
    pub fn get_next(&self) -> Option<TaskRef> {
        let mut state = self.state.lock();
        loop {
            if let Some(task) = state.pending.pop_front() {
                return Some(task);
            }
            if state.terminated {
                return None;
            }
            self.available.wait(&mut state);
        }
    }

    /// Stop accepting tasks and wake every parked consumer
    pub fn terminate(&self) -> Result<(), UsageError> {
        let mut state = self.state.lock();
        if state.terminated {
            return Err(UsageError::AlreadyTerminated);
        }
        state.terminated = true;
        let remaining = state.pending.len();
        drop(state);

        trace!(remaining, "task queue terminated");
        self.available.notify_all();
        Ok(())
    }

    /// Whether `terminate` has been called
    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    /// Number of tasks waiting
    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Check if no tasks are waiting
    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !state.terminated || !state.pending.is_empty() {
            warn!(
                terminated = state.terminated,
                pending = state.pending.len(),
                "task queue dropped before it was terminated and drained"
            );
        }
    }
}
