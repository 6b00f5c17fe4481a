//! One-shot deferred task with a typed result slot

use super::{Dispatchable, Runnable, TaskId, TaskRef, TaskState};
use crate::dispatch::Dispatcher;
use crate::engine::{EngineGuard, EngineLock};
use crate::error::{panic_message, DispatchError, LockError, TaskError, UsageError};
use crate::sync::Event;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{trace, warn};

type Callback<R, A> = Box<dyn FnOnce(&mut TaskScope<R>, A) -> Result<(), TaskError> + Send>;

/// What the callback sees while it runs.
///
/// Holds the pending result and, for engine-bound tasks, the engine lock
/// guard taken by the worker.
pub struct TaskScope<R> {
    task: TaskId,
    result: Option<R>,
    engine_lock: Option<Arc<dyn EngineLock>>,
    engine: Option<EngineGuard>,
}

impl<R> TaskScope<R> {
    /// ID of the running task
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Set the value the waiter will receive.
    ///
    /// The task's slot is written once, when the callback returns; a later
    /// call here replaces an earlier one.
    pub fn set_result(&mut self, value: R) {
        self.result = Some(value);
    }

    /// Whether this callback currently holds the engine lock
    pub fn holds_engine(&self) -> bool {
        self.engine.is_some()
    }

    /// Give up the engine lock before the callback returns
    pub fn release_engine(&mut self) -> Result<(), LockError> {
        match self.engine.take() {
            Some(guard) => guard.release(),
            None => Ok(()),
        }
    }

    /// Take the engine lock again after it was handed off.
    ///
    /// No-op for tasks that are not engine-bound or still hold the lock.
    pub fn reacquire_engine(&mut self) -> Result<(), LockError> {
        if self.engine.is_none() {
            if let Some(lock) = &self.engine_lock {
                self.engine = Some(EngineGuard::acquire(lock.clone())?);
            }
        }
        Ok(())
    }

    /// Dispatch a nested task from inside this callback.
    ///
    /// If the callback holds the engine lock it is handed over to the
    /// dispatch and released before parking. It is not taken back on return;
    /// call [`reacquire_engine`](Self::reacquire_engine) when needed.
    pub fn dispatch<T, B>(
        &mut self,
        dispatcher: &Dispatcher,
        task: &Task<T, B>,
    ) -> Result<T, DispatchError>
    where
        T: Send + 'static,
        B: Send + 'static,
    {
        match self.engine.take() {
            Some(guard) => dispatcher.do_task_releasing(task, guard),
            None => dispatcher.do_task(task),
        }
    }
}

struct TaskCore<R, A> {
    id: TaskId,
    state: Mutex<TaskState>,
    pending: Mutex<Option<(Callback<R, A>, A)>>,
    result: Mutex<Option<R>>,
    failure: Mutex<Option<String>>,
    completion: Event,
    engine: OnceCell<Arc<dyn EngineLock>>,
}

impl<R, A> TaskCore<R, A>
where
    R: Send + 'static,
    A: Send + 'static,
{
    fn execute(&self, callback: Callback<R, A>, arg: A) -> (Result<(), TaskError>, Option<R>) {
        let engine_lock = self.engine.get().cloned();
        let engine = match &engine_lock {
            Some(lock) => match EngineGuard::acquire(lock.clone()) {
                Ok(guard) => Some(guard),
                Err(err) => return (Err(err.into()), None),
            },
            None => None,
        };

        let mut scope = TaskScope {
            task: self.id,
            result: None,
            engine_lock,
            engine,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&mut scope, arg)))
            .unwrap_or_else(|payload| Err(TaskError::Panicked(panic_message(payload.as_ref()))));

        let TaskScope { result, engine, .. } = scope;

        // The lock must be free before the waiter can observe completion.
        if let Some(guard) = engine {
            if let Err(err) = guard.release() {
                warn!(task = %self.id, error = %err, "engine lock release failed");
            }
        }

        (outcome, result)
    }

    fn finish(&self, outcome: Result<(), TaskError>, value: Option<R>) -> Result<(), TaskError> {
        let (state, ret) = match outcome {
            Ok(()) => {
                *self.result.lock() = value;
                (TaskState::Completed, Ok(()))
            }
            Err(TaskError::Aborted) => {
                trace!(task = %self.id, "callback stopped on abort");
                (TaskState::Aborted, Ok(()))
            }
            Err(err) => {
                *self.failure.lock() = Some(err.to_string());
                (TaskState::Failed, Err(err))
            }
        };

        *self.state.lock() = state;
        self.completion.set();
        ret
    }
}

impl<R, A> Runnable for TaskCore<R, A>
where
    R: Send + 'static,
    A: Send + 'static,
{
    fn id(&self) -> TaskId {
        self.id
    }

    fn mark_queued(&self) -> Result<(), UsageError> {
        let mut state = self.state.lock();
        match *state {
            TaskState::Created => {
                *state = TaskState::Queued;
                Ok(())
            }
            other => Err(UsageError::NotSubmittable {
                task: self.id,
                state: other,
            }),
        }
    }

    fn run(&self) -> Result<(), TaskError> {
        {
            let mut state = self.state.lock();
            match *state {
                TaskState::Created | TaskState::Queued => *state = TaskState::Running,
                TaskState::Aborted => {
                    trace!(task = %self.id, "skipping aborted task");
                    return Ok(());
                }
                other => {
                    warn!(task = %self.id, state = ?other, "task run out of turn; ignored");
                    return Ok(());
                }
            }
        }

        let Some((callback, arg)) = self.pending.lock().take() else {
            return self.finish(Err(UsageError::TaskFinished(self.id).into()), None);
        };

        let (outcome, value) = self.execute(callback, arg);
        self.finish(outcome, value)
    }

    fn abort(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            TaskState::Created | TaskState::Queued => {
                *state = TaskState::Aborted;
                drop(state);
                self.pending.lock().take();
                self.completion.set();
                true
            }
            _ => false,
        }
    }
}

/// Deferred callback plus result slot and completion event.
///
/// The handle is the owner: dropping it while the task is still queued
/// aborts the task so the worker skips it. A running callback is left to
/// finish on its own.
pub struct Task<R, A = ()> {
    core: Arc<TaskCore<R, A>>,
    detached: bool,
}

impl<R: Send + 'static> Task<R> {
    /// Create a task over a callback that takes no argument
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(&mut TaskScope<R>) -> Result<(), TaskError> + Send + 'static,
    {
        Self::with_arg(move |scope, ()| callback(scope), ())
    }
}

impl<R, A> Task<R, A>
where
    R: Send + 'static,
    A: Send + 'static,
{
    /// Create a task over a callback and the argument it will receive
    pub fn with_arg<F>(callback: F, arg: A) -> Self
    where
        F: FnOnce(&mut TaskScope<R>, A) -> Result<(), TaskError> + Send + 'static,
    {
        let callback: Callback<R, A> = Box::new(callback);
        Self {
            core: Arc::new(TaskCore {
                id: TaskId::new(),
                state: Mutex::new(TaskState::Created),
                pending: Mutex::new(Some((callback, arg))),
                result: Mutex::new(None),
                failure: Mutex::new(None),
                completion: Event::new(),
                engine: OnceCell::new(),
            }),
            detached: false,
        }
    }

    /// Run the callback under `lock`.
    ///
    /// The worker acquires the lock before the callback starts and releases
    /// it before completion fires.
    pub fn engine_bound(self, lock: Arc<dyn EngineLock>) -> Self {
        if self.core.engine.set(lock).is_err() {
            warn!(task = %self.core.id, "engine lock already bound; keeping the first");
        }
        self
    }

    /// Engine lock this task runs under, if any
    pub fn engine_lock(&self) -> Option<&Arc<dyn EngineLock>> {
        self.core.engine.get()
    }

    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// Get the current state
    pub fn state(&self) -> TaskState {
        *self.core.state.lock()
    }

    /// Whether the completion event has fired
    pub fn is_complete(&self) -> bool {
        self.core.completion.is_set()
    }

    /// Park until the task completes, fails, or is aborted.
    ///
    /// Safe to call before the task has run.
    pub fn wait(&self) {
        self.core.completion.wait();
    }

    /// Abort the task if it has not started. Returns whether it did.
    pub fn abort(&self) -> bool {
        self.core.abort()
    }

    /// Take the result.
    ///
    /// `Ok(None)` means the task finished without one: the callback failed,
    /// was aborted, never set it, or it was already taken.
    pub fn take_result(&self) -> Result<Option<R>, UsageError> {
        if !self.core.completion.is_set() {
            return Err(UsageError::ResultNotReady(self.core.id));
        }
        Ok(self.core.result.lock().take())
    }

    /// Contained failure message, if the callback failed
    pub fn failure(&self) -> Option<String> {
        self.core.failure.lock().clone()
    }

    /// Give up ownership without aborting; the queue keeps the task alive
    /// until a worker has run it.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl<R, A> Dispatchable for Task<R, A>
where
    R: Send + 'static,
    A: Send + 'static,
{
    fn as_runnable(&self) -> TaskRef {
        self.core.clone()
    }
}

impl<R, A> Drop for Task<R, A> {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let mut state = self.core.state.lock();
        if *state == TaskState::Queued {
            *state = TaskState::Aborted;
            drop(state);
            self.core.pending.lock().take();
            self.core.completion.set();
            trace!(task = %self.core.id, "queued task dropped; aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ExclusiveLock;
    use crate::fiber::FiberId;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_task_creation() {
        let task = Task::<i32>::new(|_| Ok(()));
        assert_eq!(task.state(), TaskState::Created);
        assert!(!task.is_complete());
        assert!(task.engine_lock().is_none());
    }

    #[test]
    fn test_result_round_trip() {
        let task = Task::<i32>::new(|scope| {
            scope.set_result(42);
            Ok(())
        });

        task.as_runnable().run().unwrap();
        task.wait();

        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.take_result(), Ok(Some(42)));
        // Retrievable exactly once
        assert_eq!(task.take_result(), Ok(None));
    }

    #[test]
    fn test_result_not_ready_before_completion() {
        let task = Task::<i32>::new(|scope| {
            scope.set_result(1);
            Ok(())
        });
        assert_eq!(
            task.take_result(),
            Err(UsageError::ResultNotReady(task.id()))
        );
    }

    #[test]
    fn test_argument_passed_to_callback() {
        let task = Task::with_arg(
            |scope: &mut TaskScope<String>, name: &'static str| {
                scope.set_result(format!("hello {}", name));
                Ok(())
            },
            "fiber",
        );

        task.as_runnable().run().unwrap();
        assert_eq!(task.take_result().unwrap().as_deref(), Some("hello fiber"));
    }

    #[test]
    fn test_failing_callback_still_completes() {
        let task = Task::<i32>::new(|_| Err(TaskError::callback("script threw")));

        let err = task.as_runnable().run().unwrap_err();
        assert!(matches!(err, TaskError::Callback(_)));

        // Waiter is not stuck
        task.wait();
        assert_eq!(task.state(), TaskState::Failed);
        assert_eq!(task.take_result(), Ok(None));
        assert_eq!(
            task.failure().as_deref(),
            Some("callback failed: script threw")
        );
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let task = Task::<i32>::new(|_| panic!("bad callback"));

        let err = task.as_runnable().run().unwrap_err();
        assert!(matches!(err, TaskError::Panicked(ref msg) if msg == "bad callback"));
        assert_eq!(task.state(), TaskState::Failed);
        assert!(task.is_complete());
    }

    #[test]
    fn test_callback_returning_abort_is_consumed() {
        let task = Task::<i32>::new(|_| Err(TaskError::Aborted));

        assert!(task.as_runnable().run().is_ok());
        assert_eq!(task.state(), TaskState::Aborted);
        assert_eq!(task.take_result(), Ok(None));
    }

    #[test]
    fn test_aborted_task_is_skipped() {
        let ran = Arc::new(AtomicBool::new(false));
        let task = {
            let ran = ran.clone();
            Task::<()>::new(move |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
        };

        let runnable = task.as_runnable();
        runnable.mark_queued().unwrap();
        assert!(task.abort());
        assert!(!task.abort());

        runnable.run().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(task.state(), TaskState::Aborted);
        task.wait();
    }

    #[test]
    fn test_dropping_queued_task_aborts_it() {
        let ran = Arc::new(AtomicBool::new(false));
        let task = {
            let ran = ran.clone();
            Task::<()>::new(move |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
        };

        let runnable = task.as_runnable();
        runnable.mark_queued().unwrap();
        drop(task);

        runnable.run().unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_detached_task_still_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let task = {
            let ran = ran.clone();
            Task::<()>::new(move |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
        };

        let runnable = task.as_runnable();
        runnable.mark_queued().unwrap();
        task.detach();

        runnable.run().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_double_submit_rejected() {
        let task = Task::<()>::new(|_| Ok(()));
        let runnable = task.as_runnable();

        runnable.mark_queued().unwrap();
        assert_eq!(
            runnable.mark_queued(),
            Err(UsageError::NotSubmittable {
                task: task.id(),
                state: TaskState::Queued,
            })
        );
    }

    #[test]
    fn test_engine_lock_held_only_during_callback() {
        let lock: Arc<dyn EngineLock> = Arc::new(ExclusiveLock::new());
        let observed = Arc::new(Mutex::new(None));

        let task = {
            let bound = lock.clone();
            let lock = lock.clone();
            let observed = observed.clone();
            Task::<()>::new(move |scope| {
                assert!(scope.holds_engine());
                *observed.lock() = lock.holder();
                Ok(())
            })
            .engine_bound(bound)
        };

        task.as_runnable().run().unwrap();

        assert_eq!(*observed.lock(), Some(FiberId::current()));
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn test_release_and_reacquire_engine_in_callback() {
        let lock: Arc<dyn EngineLock> = Arc::new(ExclusiveLock::new());

        let task = {
            let bound = lock.clone();
            let lock = lock.clone();
            Task::<bool>::new(move |scope| {
                scope.release_engine()?;
                let released = lock.holder().is_none();
                scope.reacquire_engine()?;
                scope.set_result(released && scope.holds_engine());
                Ok(())
            })
            .engine_bound(bound)
        };

        task.as_runnable().run().unwrap();
        assert_eq!(task.take_result(), Ok(Some(true)));
        assert_eq!(lock.holder(), None);
    }
}
