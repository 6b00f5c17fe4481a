//! Worker fiber that executes queued tasks
//!
//! A worker pulls from the pool's queue until the queue reports termination,
//! runs each task on its own fiber, and counts itself out when it leaves.
//! The last worker to leave releases the pool's shutdown semaphore.

use crate::error::{panic_message, SchedulerError};
use crate::fiber::Scheduler;
use crate::queue::TaskQueue;
use crate::sync::Semaphore;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Pool whose run loop owns this fiber
    static CURRENT_POOL: Cell<Option<u64>> = const { Cell::new(None) };
}

/// State shared between a pool and its workers
pub(super) struct PoolShared {
    id: u64,

    pub(super) queue: TaskQueue,

    /// Workers actually placed on fibers
    pub(super) spawned: AtomicUsize,

    /// Workers that have left their run loop
    pub(super) exited: AtomicUsize,

    /// Released once by the last exiting worker
    pub(super) shutdown: Semaphore,

    /// Tasks that ran to completion
    pub(super) executed: AtomicU64,

    /// Tasks whose callback failed or panicked
    pub(super) failed: AtomicU64,
}

impl PoolShared {
    pub(super) fn new() -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            queue: TaskQueue::new(),
            spawned: AtomicUsize::new(0),
            exited: AtomicUsize::new(0),
            shutdown: Semaphore::new(0),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Whether the calling fiber is one of this pool's workers
    pub(super) fn is_own_worker(&self) -> bool {
        CURRENT_POOL.with(|current| current.get() == Some(self.id))
    }
}

/// Worker fiber handle
pub(super) struct Worker {
    name: String,
    shared: Arc<PoolShared>,
}

impl Worker {
    pub(super) fn new(name: String, shared: Arc<PoolShared>) -> Self {
        Self { name, shared }
    }

    /// Place the worker's run loop on a fiber
    pub(super) fn start(self, scheduler: &dyn Scheduler) -> Result<(), SchedulerError> {
        let name = self.name.clone();
        scheduler.schedule(name, Box::new(move || self.run_loop()))
    }

    fn run_loop(self) {
        CURRENT_POOL.with(|current| current.set(Some(self.shared.id)));
        debug!(worker = %self.name, "worker started");

        while let Some(task) = self.shared.queue.get_next() {
            let id = task.id();
            trace!(worker = %self.name, task = %id, "running task");

            match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
                Ok(Ok(())) => {
                    self.shared.executed.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(err)) => {
                    self.shared.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(worker = %self.name, task = %id, error = %err, "task failed");
                }
                Err(payload) => {
                    self.shared.failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        worker = %self.name,
                        task = %id,
                        panic = %panic_message(payload.as_ref()),
                        "task runner panicked"
                    );
                }
            }
        }

        CURRENT_POOL.with(|current| current.set(None));
        let exited = self.shared.exited.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(worker = %self.name, exited, "worker exiting");
        if exited == self.shared.spawned.load(Ordering::Acquire) {
            self.shared.shutdown.release();
        }
    }
}
