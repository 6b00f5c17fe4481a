//! Coroutine task
//!
//! The callback runs on a fiber of its own and alternates strictly with
//! whoever drives it. Two capacity-1 channels carry the handshake: `call`
//! writes the next argument into the resume channel and reads the callback's
//! next yield (or its end) from the event channel.
//!
//! Cancellation travels the same way. Resetting or dropping a task parked
//! at a yield point sends `Resume::Abort`; the pending `yield_value` returns
//! `Err(TaskError::Aborted)` and the callback unwinds through ordinary
//! scope exit. The driver waits for that unwind to finish before it returns.
//!
//! On a pool each submission runs one step; `wait_step` parks until it ends.

use super::{Dispatchable, Runnable, TaskId, TaskRef, TaskState};
use crate::error::{panic_message, TaskError, UsageError};
use crate::fiber::{Scheduler, ThreadScheduler};
use crate::sync::Event;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, trace};

type CoCallback<Y, A> =
    Box<dyn FnMut(&mut CoScope<Y, A>, A) -> Result<(), TaskError> + Send>;

/// Outcome of one `call`
#[derive(Debug, PartialEq, Eq)]
pub enum CoStep<Y> {
    /// The callback parked at a yield point, handing back a value
    Yielded(Y),
    /// The callback has finished; see `take_result`
    Complete,
}

enum Resume<A> {
    Next(A),
    Abort,
}

enum CoEvent<Y, A> {
    Yielded(Y),
    /// The callback comes back with the outcome so a reset can run it again.
    Finished {
        outcome: Result<Option<Y>, TaskError>,
        callback: CoCallback<Y, A>,
    },
}

/// What a coroutine callback sees while it runs.
pub struct CoScope<Y, A> {
    task: TaskId,
    resume_rx: Receiver<Resume<A>>,
    event_tx: Sender<CoEvent<Y, A>>,
    result: Option<Y>,
    aborted: bool,
}

impl<Y, A> CoScope<Y, A> {
    /// ID of the running task
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// Park, handing `value` to the driver.
    ///
    /// Returns the argument of the next `call`, or `Err(TaskError::Aborted)`
    /// if the task was reset or dropped while parked. Once aborted, every
    /// further yield fails immediately.
    pub fn yield_value(&mut self, value: Y) -> Result<A, TaskError> {
        if self.aborted {
            return Err(TaskError::Aborted);
        }
        if self.event_tx.send(CoEvent::Yielded(value)).is_err() {
            self.aborted = true;
            return Err(TaskError::Aborted);
        }
        match self.resume_rx.recv() {
            Ok(Resume::Next(arg)) => Ok(arg),
            Ok(Resume::Abort) | Err(_) => {
                self.aborted = true;
                Err(TaskError::Aborted)
            }
        }
    }

    /// Set the terminal result
    pub fn set_result(&mut self, value: Y) {
        self.result = Some(value);
    }

    /// Whether the abort condition has been delivered
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }
}

struct Link<Y, A> {
    resume_tx: Sender<Resume<A>>,
    event_rx: Receiver<CoEvent<Y, A>>,
}

struct CoCore<Y, A> {
    id: TaskId,
    scheduler: Arc<dyn Scheduler>,
    /// Held for the duration of a step, reset or abort
    turn: Mutex<()>,
    state: Mutex<TaskState>,
    callback: Mutex<Option<CoCallback<Y, A>>>,
    link: Mutex<Option<Link<Y, A>>>,
    /// Last value yielded during a pool-driven step
    yielded: Mutex<Option<Y>>,
    result: Mutex<Option<Y>>,
    failure: Mutex<Option<String>>,
    /// Replaced on reset so each run has its own completion
    completion: Mutex<Arc<Event>>,
    /// Fired when a pool-driven step ends; re-armed on every submission
    step_done: Mutex<Arc<Event>>,
}

impl<Y, A> CoCore<Y, A> {
    fn state(&self) -> TaskState {
        *self.state.lock()
    }

    fn completion(&self) -> Arc<Event> {
        self.completion.lock().clone()
    }

    fn step_done(&self) -> Arc<Event> {
        self.step_done.lock().clone()
    }

    fn conclude(
        &self,
        outcome: Result<Option<Y>, TaskError>,
        callback: Option<CoCallback<Y, A>>,
    ) -> Result<CoStep<Y>, TaskError> {
        *self.link.lock() = None;
        if callback.is_some() {
            *self.callback.lock() = callback;
        }

        let (state, ret) = match outcome {
            Ok(value) => {
                *self.result.lock() = value;
                (TaskState::Completed, Ok(CoStep::Complete))
            }
            Err(TaskError::Aborted) => (TaskState::Aborted, Ok(CoStep::Complete)),
            Err(err) => {
                *self.failure.lock() = Some(err.to_string());
                (TaskState::Failed, Err(err))
            }
        };

        *self.state.lock() = state;
        self.completion().set();
        ret
    }

    /// Abort a parked callback and wait until it has unwound.
    /// Caller holds `turn`.
    fn unwind(&self) {
        let Some(link) = self.link.lock().take() else {
            return;
        };
        if self.state() != TaskState::Suspended {
            return;
        }

        trace!(task = %self.id, "injecting abort into parked callback");
        let _ = link.resume_tx.send(Resume::Abort);
        while let Ok(event) = link.event_rx.recv() {
            if let CoEvent::Finished { outcome, callback } = event {
                if let Err(err) = outcome {
                    if !err.is_aborted() {
                        debug!(task = %self.id, error = %err, "callback failed while unwinding");
                    }
                }
                *self.callback.lock() = Some(callback);
                break;
            }
        }
    }

    /// Return to `Created`, keeping the callback for another run
    fn restart(&self) {
        let _turn = self.turn.lock();
        self.unwind();

        let previous = std::mem::replace(&mut *self.completion.lock(), Arc::new(Event::new()));
        previous.set();
        self.step_done().set();

        *self.state.lock() = TaskState::Created;
        *self.yielded.lock() = None;
        *self.result.lock() = None;
        *self.failure.lock() = None;
    }

    /// Terminal abort: unwinds a parked callback and fires completion.
    /// Returns false if the task had already finished.
    fn shutdown(&self) -> bool {
        let _turn = self.turn.lock();
        let state = self.state();
        if state.is_terminal() {
            return false;
        }
        self.unwind();
        *self.state.lock() = TaskState::Aborted;
        self.completion().set();
        self.step_done().set();
        trace!(task = %self.id, from = ?state, "coroutine task aborted");
        true
    }
}

impl<Y, A> CoCore<Y, A>
where
    Y: Send + 'static,
    A: Send + 'static,
{
    fn step(&self, arg: A) -> Result<CoStep<Y>, TaskError> {
        let _turn = self.turn.lock();

        let current = {
            let mut state = self.state.lock();
            let current = *state;
            match current {
                TaskState::Created | TaskState::Queued | TaskState::Suspended => {
                    *state = TaskState::Running;
                }
                TaskState::Aborted => return Ok(CoStep::Complete),
                _ => return Err(UsageError::TaskFinished(self.id).into()),
            }
            current
        };

        let sent = if current == TaskState::Suspended {
            self.resume(arg)
        } else {
            self.start(arg)
        };

        if let Err(err) = sent {
            return self.conclude(Err(err), None);
        }

        let events = self.link.lock().as_ref().map(|link| link.event_rx.clone());
        let Some(events) = events else {
            return self.conclude(Err(UsageError::TaskFinished(self.id).into()), None);
        };

        match events.recv() {
            Ok(CoEvent::Yielded(value)) => {
                *self.state.lock() = TaskState::Suspended;
                Ok(CoStep::Yielded(value))
            }
            Ok(CoEvent::Finished { outcome, callback }) => self.conclude(outcome, Some(callback)),
            Err(_) => self.conclude(
                Err(TaskError::Panicked(
                    "coroutine fiber exited without reporting".to_string(),
                )),
                None,
            ),
        }
    }

    fn start(&self, arg: A) -> Result<(), TaskError> {
        let mut callback = self
            .callback
            .lock()
            .take()
            .ok_or(UsageError::TaskFinished(self.id))?;

        let (resume_tx, resume_rx) = bounded(1);
        let (event_tx, event_rx) = bounded(1);
        *self.link.lock() = Some(Link {
            resume_tx,
            event_rx,
        });

        let mut scope = CoScope {
            task: self.id,
            resume_rx,
            event_tx,
            result: None,
            aborted: false,
        };

        let body = move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&mut scope, arg)))
                .unwrap_or_else(|payload| {
                    Err(TaskError::Panicked(panic_message(payload.as_ref())))
                });
            let outcome = outcome.map(|()| scope.result.take());
            let _ = scope.event_tx.send(CoEvent::Finished { outcome, callback });
        };

        self.scheduler
            .schedule(format!("skein-co-{}", self.id.as_u64()), Box::new(body))?;
        Ok(())
    }

    fn resume(&self, arg: A) -> Result<(), TaskError> {
        let sent = match self.link.lock().as_ref() {
            Some(link) => link.resume_tx.send(Resume::Next(arg)).is_ok(),
            None => false,
        };
        if sent {
            Ok(())
        } else {
            Err(UsageError::TaskFinished(self.id).into())
        }
    }
}

impl<Y, A> Runnable for CoCore<Y, A>
where
    Y: Send + 'static,
    A: Default + Send + 'static,
{
    fn id(&self) -> TaskId {
        self.id
    }

    fn mark_queued(&self) -> Result<(), UsageError> {
        let mut state = self.state.lock();
        match *state {
            TaskState::Created => *state = TaskState::Queued,
            TaskState::Suspended => {}
            other => {
                return Err(UsageError::NotSubmittable {
                    task: self.id,
                    state: other,
                })
            }
        }
        *self.step_done.lock() = Arc::new(Event::new());
        Ok(())
    }

    fn run(&self) -> Result<(), TaskError> {
        let outcome = match self.step(A::default()) {
            Ok(CoStep::Yielded(value)) => {
                *self.yielded.lock() = Some(value);
                Ok(())
            }
            Ok(CoStep::Complete) => Ok(()),
            Err(err) => Err(err),
        };
        self.step_done().set();
        outcome
    }

    fn abort(&self) -> bool {
        let mut state = self.state.lock();
        match *state {
            TaskState::Created | TaskState::Queued => {
                *state = TaskState::Aborted;
                drop(state);
                self.completion().set();
                self.step_done().set();
                true
            }
            _ => false,
        }
    }
}

/// Generator-style task that can park mid-callback.
///
/// Each [`call`](Self::call) runs the callback until it yields or finishes.
/// Dropping the task while it is parked aborts it.
pub struct CoTask<Y, A = ()> {
    core: Arc<CoCore<Y, A>>,
}

impl<Y, A> CoTask<Y, A>
where
    Y: Send + 'static,
    A: Send + 'static,
{
    /// Create a coroutine task whose callback runs on its own OS thread
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(&mut CoScope<Y, A>, A) -> Result<(), TaskError> + Send + 'static,
    {
        Self::with_scheduler(Arc::new(ThreadScheduler::new()), callback)
    }

    /// Create a coroutine task whose callback fiber is placed by `scheduler`
    pub fn with_scheduler<F>(scheduler: Arc<dyn Scheduler>, callback: F) -> Self
    where
        F: FnMut(&mut CoScope<Y, A>, A) -> Result<(), TaskError> + Send + 'static,
    {
        let callback: CoCallback<Y, A> = Box::new(callback);
        Self {
            core: Arc::new(CoCore {
                id: TaskId::new(),
                scheduler,
                turn: Mutex::new(()),
                state: Mutex::new(TaskState::Created),
                callback: Mutex::new(Some(callback)),
                link: Mutex::new(None),
                yielded: Mutex::new(None),
                result: Mutex::new(None),
                failure: Mutex::new(None),
                completion: Mutex::new(Arc::new(Event::new())),
                step_done: Mutex::new(Arc::new(Event::fired())),
            }),
        }
    }

    /// Run the callback until its next yield or its end.
    ///
    /// The first call starts the callback with `arg`; later calls resume it,
    /// delivering `arg` as the return value of the pending yield.
    pub fn call(&self, arg: A) -> Result<CoStep<Y>, TaskError> {
        self.core.step(arg)
    }

    /// Abort a parked callback and return to `Created` with the same callback
    pub fn reset(&self) {
        self.core.restart();
    }

    /// Reset, then run `callback` on the next call instead
    pub fn reset_with<F>(&self, callback: F)
    where
        F: FnMut(&mut CoScope<Y, A>, A) -> Result<(), TaskError> + Send + 'static,
    {
        let callback: CoCallback<Y, A> = Box::new(callback);
        self.core.restart();
        *self.core.callback.lock() = Some(callback);
    }

    /// Get the Task's unique ID
    pub fn id(&self) -> TaskId {
        self.core.id
    }

    /// Get the current state
    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    /// Park until this run completes, fails, is aborted, or is reset
    pub fn wait(&self) {
        self.core.completion().wait();
    }

    /// Take the terminal result; `Err` until the run has finished
    pub fn take_result(&self) -> Result<Option<Y>, UsageError> {
        if !self.core.completion().is_set() {
            return Err(UsageError::ResultNotReady(self.core.id));
        }
        Ok(self.core.result.lock().take())
    }

    /// Park until the pool step started by the last submission has ended.
    ///
    /// Returns at once if no step is outstanding.
    pub fn wait_step(&self) {
        self.core.step_done().wait();
    }

    /// Abort the task, unwinding a parked callback first.
    ///
    /// Returns false if it had already finished.
    pub fn abort(&self) -> bool {
        self.core.shutdown()
    }

    /// Take the value yielded during the last pool-driven step
    pub fn take_yielded(&self) -> Option<Y> {
        self.core.yielded.lock().take()
    }

    /// Contained failure message, if the callback failed
    pub fn failure(&self) -> Option<String> {
        self.core.failure.lock().clone()
    }
}

impl<Y: Send + 'static> CoTask<Y, ()> {
    /// Step a coroutine that takes no arguments
    pub fn resume(&self) -> Result<CoStep<Y>, TaskError> {
        self.call(())
    }
}

impl<Y, A> Dispatchable for CoTask<Y, A>
where
    Y: Send + 'static,
    A: Default + Send + 'static,
{
    fn as_runnable(&self) -> TaskRef {
        self.core.clone()
    }
}

impl<Y, A> Drop for CoTask<Y, A> {
    fn drop(&mut self) {
        self.core.shutdown();
    }
}
