//! Units of work
//!
//! A [`Task`] is a deferred callback plus its result slot and completion
//! event. A [`CoTask`] adds a yield/resume protocol for generator-style work
//! that parks mid-callback. Both are handed to the queue as [`TaskRef`]s,
//! shared references to something [`Runnable`]; the submitting fiber keeps
//! the owning handle.

mod co;
#[allow(clippy::module_inception)]
mod task;

pub use co::{CoScope, CoStep, CoTask};
pub use task::{Task, TaskScope};

use crate::error::{TaskError, UsageError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Unique identifier for a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

impl TaskId {
    /// Generate a new unique TaskId
    pub fn new() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// State of a Task
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Just created, not yet submitted
    Created,
    /// Waiting in a task queue
    Queued,
    /// Currently executing
    Running,
    /// Parked at a yield point (coroutine tasks only)
    Suspended,
    /// Finished; a result may have been set
    Completed,
    /// Callback errored or panicked; no result
    Failed,
    /// Aborted before finishing; no result
    Aborted,
}

impl TaskState {
    /// Whether the task can make no further progress
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Aborted
        )
    }
}

/// Something a worker fiber can execute.
pub trait Runnable: Send + Sync {
    /// Task identity, for diagnostics
    fn id(&self) -> TaskId;

    /// Record the hand-off to a queue.
    ///
    /// Rejects tasks that are already in flight or finished.
    fn mark_queued(&self) -> Result<(), UsageError>;

    /// Execute one step on the current fiber.
    ///
    /// Errors are callback failures the caller is expected to contain; the
    /// task's completion event has already fired when one is returned.
    fn run(&self) -> Result<(), TaskError>;

    /// Abort the task if it has not started running. Returns whether it did.
    fn abort(&self) -> bool;
}

/// Shared, non-owning reference to queued work.
pub type TaskRef = Arc<dyn Runnable>;

/// Owning handles that can be submitted to a worker pool.
pub trait Dispatchable {
    /// The shared reference the queue and worker hold while in flight
    fn as_runnable(&self) -> TaskRef;
}
