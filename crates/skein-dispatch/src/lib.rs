//! Skein fiber-affine task dispatch
//!
//! This crate runs deferred callbacks on a small pool of worker fibers and
//! lets the submitting fiber park until they finish:
//! - Tasks with a typed result slot and a one-shot completion event
//! - Coroutine tasks that yield mid-callback and resume on demand
//! - A blocking multi-consumer task queue
//! - A fixed-size worker pool with lazy start and draining shutdown
//! - Synchronous dispatch with engine-lock handoff
//!
//! Tasks bound to an [`EngineLock`] run with that lock held by the worker.
//! A fiber that holds the lock itself must hand its [`EngineGuard`] to the
//! dispatch, which releases it before parking.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fiber;
pub mod pool;
pub mod queue;
pub mod sync;
pub mod task;

pub use config::{ConfigError, DispatchConfig, POOL_SIZE_ENV};
pub use dispatch::Dispatcher;
pub use engine::{EngineGuard, EngineLock, ExclusiveLock};
pub use error::{DispatchError, LockError, SchedulerError, TaskError, UsageError};
pub use fiber::{FiberBody, FiberId, Scheduler, ThreadScheduler};
pub use pool::{resolve_pool_size, PoolStats, WorkerPool, MAX_POOL_SIZE};
pub use queue::TaskQueue;
pub use task::{
    CoScope, CoStep, CoTask, Dispatchable, Runnable, Task, TaskId, TaskRef, TaskScope, TaskState,
};

/// Result of a synchronous dispatch
pub type DispatchResult<T> = Result<T, DispatchError>;
