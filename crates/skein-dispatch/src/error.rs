//! Error types for task dispatch.
//!
//! Errors are split by who is at fault:
//! - [`UsageError`]: the caller broke the protocol (programming defect)
//! - [`TaskError`]: the unit of work itself failed or was aborted
//! - [`LockError`]: the engine lock was used out of order
//! - [`SchedulerError`]: the fiber scheduling service refused a fiber
//! - [`DispatchError`]: everything `do_task` can surface to its caller

use crate::fiber::FiberId;
use crate::task::{TaskId, TaskState};
use std::any::Any;
use std::io;

/// Protocol violations by the caller. Never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UsageError {
    /// `append` after the queue was terminated
    #[error("task queue is terminated")]
    QueueTerminated,

    /// `terminate` called a second time
    #[error("task queue already terminated")]
    AlreadyTerminated,

    /// Result read before the completion event fired
    #[error("result of {0} read before completion")]
    ResultNotReady(TaskId),

    /// Task handed to the queue while not in a submittable state
    #[error("{task} cannot be submitted while {state:?}")]
    NotSubmittable {
        /// Offending task
        task: TaskId,
        /// State it was in
        state: TaskState,
    },

    /// Coroutine task called again after it finished
    #[error("{0} already finished")]
    TaskFinished(TaskId),

    /// `stop` called from one of the pool's own workers, which would wait
    /// on itself
    #[error("worker pool stopped from one of its own workers")]
    StopFromWorker,

    /// Negative pool size passed to a strict constructor
    #[error("invalid pool size: {0}")]
    InvalidPoolSize(i64),

    /// The submitting fiber holds the engine lock an engine-bound task needs
    #[error("{fiber:?} holds the engine lock while dispatching engine-bound {task}")]
    LockHeldAcrossDispatch {
        /// Submitting fiber
        fiber: FiberId,
        /// Engine-bound task
        task: TaskId,
    },
}

/// Failure of a single unit of work.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Injected into a parked callback when its task is reset or dropped.
    /// Consumed by the task runner; never escapes `call()`.
    #[error("task aborted")]
    Aborted,

    /// Callback returned an error
    #[error("callback failed: {0}")]
    Callback(Box<dyn std::error::Error + Send + Sync>),

    /// Callback panicked
    #[error("callback panicked: {0}")]
    Panicked(String),

    /// Engine lock could not be taken for an engine-bound callback
    #[error(transparent)]
    Lock(#[from] LockError),

    /// Coroutine fiber could not be scheduled
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Task was driven out of protocol
    #[error(transparent)]
    Usage(#[from] UsageError),
}

impl TaskError {
    /// Wrap any error (or message) as a callback failure.
    pub fn callback<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        TaskError::Callback(err.into())
    }

    /// Whether this is the injected abort condition
    pub fn is_aborted(&self) -> bool {
        matches!(self, TaskError::Aborted)
    }
}

/// Engine lock protocol violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The holder tried to acquire the lock again (the lock is not reentrant)
    #[error("engine lock already held by {0:?}")]
    Reentrant(FiberId),

    /// Release called by a fiber that does not hold the lock
    #[error("engine lock released by non-owner {0:?}")]
    NotOwner(FiberId),
}

/// Failure of the fiber scheduling service.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The fiber could not be placed on an OS thread
    #[error("failed to schedule fiber {name}: {source}")]
    Spawn {
        /// Fiber name
        name: String,
        /// Underlying spawn error
        #[source]
        source: io::Error,
    },
}

/// Everything a synchronous dispatch can report.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Caller broke the protocol
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// Worker fibers could not be started
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// Task ran to completion without producing a result
    #[error("{task} completed without a result")]
    NoResult {
        /// Task that ran
        task: TaskId,
        /// Contained callback failure, if the callback errored
        failure: Option<String>,
    },

    /// Task was aborted before it produced anything
    #[error("{0} was aborted")]
    Aborted(TaskId),
}

/// Best-effort message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_callback_error_from_message() {
        let err = TaskError::callback("boom");
        assert_eq!(err.to_string(), "callback failed: boom");
        assert!(!err.is_aborted());
        assert!(TaskError::Aborted.is_aborted());
    }

    #[test]
    fn test_panic_message_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(payload.as_ref()), "static str");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");

        let payload: Box<dyn Any + Send> = Box::new(42u8);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn test_usage_error_converts_into_dispatch_error() {
        let err: DispatchError = UsageError::QueueTerminated.into();
        assert!(matches!(err, DispatchError::Usage(UsageError::QueueTerminated)));
    }
}
