//! Worker pool lifecycle and submission

use super::worker::{PoolShared, Worker};
use crate::config::DispatchConfig;
use crate::error::{DispatchError, SchedulerError, TaskError, UsageError};
use crate::fiber::{Scheduler, ThreadScheduler};
use crate::task::{Dispatchable, Task};
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upper bound on worker fibers in one pool
pub const MAX_POOL_SIZE: usize = 4;

/// Default prefix for worker fiber names
pub(crate) const DEFAULT_NAME_PREFIX: &str = "skein-worker";

/// Turn a size hint into a worker count.
///
/// Hints of zero or less mean "one per CPU". The result is always in
/// `1..=MAX_POOL_SIZE`.
pub fn resolve_pool_size(hint: i64) -> usize {
    let wanted = if hint <= 0 {
        num_cpus::get()
    } else {
        usize::try_from(hint).unwrap_or(MAX_POOL_SIZE)
    };
    wanted.clamp(1, MAX_POOL_SIZE)
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Workers currently in their run loop
    pub live_workers: usize,
    /// Tasks waiting in the queue
    pub queued: usize,
    /// Tasks that ran to completion
    pub executed: u64,
    /// Tasks whose callback failed or panicked
    pub failed: u64,
}

#[derive(Default)]
struct Lifecycle {
    initialized: bool,
    stopped: bool,
}

/// Fixed set of worker fibers sharing one task queue.
///
/// Workers start lazily on the first submission. `stop` drains the queue
/// and parks until every worker has exited.
pub struct WorkerPool {
    size: usize,
    name_prefix: String,
    scheduler: Arc<dyn Scheduler>,
    shared: Arc<PoolShared>,
    lifecycle: Mutex<Lifecycle>,
}

impl WorkerPool {
    /// Create a pool whose workers each get their own OS thread
    pub fn new(size_hint: i64) -> Self {
        Self::with_scheduler(size_hint, Arc::new(ThreadScheduler::new()))
    }

    /// Create a pool whose workers are placed by `scheduler`
    pub fn with_scheduler(size_hint: i64, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::build(
            resolve_pool_size(size_hint),
            DEFAULT_NAME_PREFIX.to_string(),
            scheduler,
        )
    }

    /// Like [`new`](Self::new) but rejects negative hints
    pub fn try_new(size_hint: i64) -> Result<Self, UsageError> {
        if size_hint < 0 {
            return Err(UsageError::InvalidPoolSize(size_hint));
        }
        Ok(Self::new(size_hint))
    }

    /// Create a pool from loaded configuration
    pub fn from_config(config: &DispatchConfig, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::build(
            config.resolved_pool_size(),
            config.thread_name_prefix.clone(),
            scheduler,
        )
    }

    fn build(size: usize, name_prefix: String, scheduler: Arc<dyn Scheduler>) -> Self {
        debug!(size, prefix = %name_prefix, "worker pool created");
        Self {
            size,
            name_prefix,
            scheduler,
            shared: Arc::new(PoolShared::new()),
            lifecycle: Mutex::new(Lifecycle::default()),
        }
    }

    /// Number of workers this pool runs once started
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether the worker fibers have been started
    pub fn is_initialized(&self) -> bool {
        self.lifecycle.lock().initialized
    }

    /// Whether `stop` has been called
    pub fn is_stopped(&self) -> bool {
        self.lifecycle.lock().stopped
    }

    /// Workers currently in their run loop
    pub fn live_workers(&self) -> usize {
        let spawned = self.shared.spawned.load(Ordering::Acquire);
        spawned.saturating_sub(self.shared.exited.load(Ordering::Acquire))
    }

    /// Snapshot of the pool counters
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_workers: self.live_workers(),
            queued: self.shared.queue.len(),
            executed: self.shared.executed.load(Ordering::Relaxed),
            failed: self.shared.failed.load(Ordering::Relaxed),
        }
    }

    /// Start the worker fibers if they are not running yet.
    ///
    /// Idempotent. A stopped pool is never started. If the scheduler refuses
    /// a worker part-way, the workers already placed keep serving the pool.
    pub fn ensure_initialized(&self) -> Result<(), SchedulerError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.initialized || lifecycle.stopped {
            return Ok(());
        }

        let mut spawned = 0;
        let mut failure = None;
        for i in 0..self.size {
            let name = format!("{}-{}", self.name_prefix, i);
            match Worker::new(name, self.shared.clone()).start(self.scheduler.as_ref()) {
                Ok(()) => spawned += 1,
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        self.shared.spawned.store(spawned, Ordering::Release);
        lifecycle.initialized = spawned > 0;

        match failure {
            None => {
                info!(workers = spawned, "worker pool started");
                Ok(())
            }
            Some(err) => {
                warn!(workers = spawned, wanted = self.size, error = %err, "worker pool started short");
                Err(err)
            }
        }
    }

    /// Hand a task to the pool.
    ///
    /// Starts the workers on first use. The task must not already be in
    /// flight; on an error it is aborted if it had not started.
    pub fn submit<T>(&self, task: &T) -> Result<(), DispatchError>
    where
        T: Dispatchable + ?Sized,
    {
        self.ensure_initialized()?;

        let runnable = task.as_runnable();
        runnable.mark_queued()?;
        if let Err(err) = self.shared.queue.append(runnable.clone()) {
            runnable.abort();
            return Err(err.into());
        }
        Ok(())
    }

    /// Run `callback` on a worker without waiting for it
    pub fn post<F>(&self, callback: F) -> Result<(), DispatchError>
    where
        F: FnOnce() -> Result<(), TaskError> + Send + 'static,
    {
        let task = Task::<()>::new(move |_| callback());
        self.submit(&task)?;
        task.detach();
        Ok(())
    }

    /// Terminate the queue and park until every worker has exited.
    ///
    /// Tasks already queued still run. Fails with
    /// [`UsageError::StopFromWorker`] on one of this pool's own workers.
    pub fn stop(&self) -> Result<(), UsageError> {
        if self.shared.is_own_worker() {
            return Err(UsageError::StopFromWorker);
        }
        let spawned = self.terminate()?;

        if spawned > 0 {
            debug!(workers = spawned, "waiting for workers to drain the queue");
            self.shared.shutdown.acquire();
        }
        info!(workers = spawned, "worker pool stopped");
        Ok(())
    }

    /// Mark stopped and terminate the queue; returns the workers placed
    fn terminate(&self) -> Result<usize, UsageError> {
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.stopped {
            return Err(UsageError::AlreadyTerminated);
        }
        lifecycle.stopped = true;
        self.shared.queue.terminate()?;
        Ok(self.shared.spawned.load(Ordering::Acquire))
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.lifecycle.get_mut().stopped {
            return;
        }
        // Last handle released inside a task: the workers finish the queue
        // and exit on their own.
        let outcome = if self.shared.is_own_worker() {
            self.terminate().map(|workers| {
                debug!(workers, "worker pool dropped on its own worker; not waiting");
            })
        } else {
            self.stop()
        };
        if let Err(err) = outcome {
            warn!(error = %err, "worker pool stop on drop failed");
        }
    }
}
