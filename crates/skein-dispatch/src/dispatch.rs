//! Synchronous dispatch onto the worker pool
//!
//! `do_task` submits a task, parks the calling fiber on the task's
//! completion event and hands back the result. The engine lock is never held
//! while parked: a caller that holds it passes its [`EngineGuard`] to
//! [`Dispatcher::do_task_releasing`], which releases it once the task is
//! queued. A dispatcher built [`with_engine`](Dispatcher::with_engine)
//! refuses every dispatch from a fiber that still holds its lock, since any
//! callback may reach for the engine further down. Without one, only
//! engine-bound tasks can be checked.

use crate::engine::{EngineGuard, EngineLock};
use crate::error::{DispatchError, TaskError, UsageError};
use crate::fiber::FiberId;
use crate::pool::WorkerPool;
use crate::task::{Task, TaskState};
use std::sync::Arc;
use tracing::{trace, warn};

/// Front end for running tasks on a shared pool and waiting for them.
#[derive(Clone)]
pub struct Dispatcher {
    pool: Arc<WorkerPool>,
    engine: Option<Arc<dyn EngineLock>>,
}

impl Dispatcher {
    /// Create a dispatcher over `pool`
    pub fn new(pool: Arc<WorkerPool>) -> Self {
        Self { pool, engine: None }
    }

    /// Create a dispatcher that guards `engine` on every dispatch.
    ///
    /// A fiber holding `engine` must hand its guard over, whatever the
    /// task does.
    pub fn with_engine(pool: Arc<WorkerPool>, engine: Arc<dyn EngineLock>) -> Self {
        Self {
            pool,
            engine: Some(engine),
        }
    }

    /// The pool tasks run on
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The engine lock this dispatcher guards, if any
    pub fn engine(&self) -> Option<&Arc<dyn EngineLock>> {
        self.engine.as_ref()
    }

    /// Run `task` on a worker, park until it finishes and return its result.
    ///
    /// Fails with [`DispatchError::NoResult`] if the callback failed or never
    /// set a result.
    pub fn do_task<R, A>(&self, task: &Task<R, A>) -> Result<R, DispatchError>
    where
        R: Send + 'static,
        A: Send + 'static,
    {
        self.park(task, None)?;
        take_value(task)
    }

    /// Like [`do_task`](Self::do_task), but gives up `guard` before parking.
    ///
    /// The lock is not taken back on return.
    pub fn do_task_releasing<R, A>(
        &self,
        task: &Task<R, A>,
        guard: EngineGuard,
    ) -> Result<R, DispatchError>
    where
        R: Send + 'static,
        A: Send + 'static,
    {
        self.park(task, Some(guard))?;
        take_value(task)
    }

    /// Run a task that produces no value and park until it finishes
    pub fn do_void_task<A>(&self, task: &Task<(), A>) -> Result<(), DispatchError>
    where
        A: Send + 'static,
    {
        self.park(task, None)
    }

    /// Run `callback` on a worker and return what it returns
    pub fn call<R, F>(&self, callback: F) -> Result<R, DispatchError>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R, TaskError> + Send + 'static,
    {
        let task = Task::<R>::new(move |scope| {
            scope.set_result(callback()?);
            Ok(())
        });
        self.do_task(&task)
    }

    /// Run `callback` on a worker while it holds `lock`.
    ///
    /// A caller holding the lock must pass its guard as `held`.
    pub fn call_engine<R, F>(
        &self,
        lock: Arc<dyn EngineLock>,
        held: Option<EngineGuard>,
        callback: F,
    ) -> Result<R, DispatchError>
    where
        R: Send + 'static,
        F: FnOnce() -> Result<R, TaskError> + Send + 'static,
    {
        let task = Task::<R>::new(move |scope| {
            scope.set_result(callback()?);
            Ok(())
        })
        .engine_bound(lock);

        match held {
            Some(guard) => self.do_task_releasing(&task, guard),
            None => self.do_task(&task),
        }
    }

    fn park<R, A>(&self, task: &Task<R, A>, guard: Option<EngineGuard>) -> Result<(), DispatchError>
    where
        R: Send + 'static,
        A: Send + 'static,
    {
        if guard.is_none() {
            let held = self
                .engine
                .iter()
                .chain(task.engine_lock())
                .any(|lock| lock.is_held_by_current());
            if held {
                return Err(UsageError::LockHeldAcrossDispatch {
                    fiber: FiberId::current(),
                    task: task.id(),
                }
                .into());
            }
        }

        self.pool.submit(task)?;

        if let Some(guard) = guard {
            if let Err(err) = guard.release() {
                warn!(task = %task.id(), error = %err, "engine lock release before park failed");
            }
        }

        trace!(task = %task.id(), "parking until task finishes");
        task.wait();

        match task.state() {
            TaskState::Completed => Ok(()),
            TaskState::Failed => Err(DispatchError::NoResult {
                task: task.id(),
                failure: task.failure(),
            }),
            _ => Err(DispatchError::Aborted(task.id())),
        }
    }
}

fn take_value<R, A>(task: &Task<R, A>) -> Result<R, DispatchError>
where
    R: Send + 'static,
    A: Send + 'static,
{
    task.take_result()?.ok_or(DispatchError::NoResult {
        task: task.id(),
        failure: None,
    })
}
