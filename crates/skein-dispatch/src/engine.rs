//! Engine lock coordination
//!
//! The embedded script engine allows one fiber at a time inside its
//! execution context. [`EngineLock`] is the boundary to that lock: the
//! dispatch core only brackets callbacks with `acquire`/`release` and never
//! looks at engine state. [`ExclusiveLock`] is a stand-alone implementation;
//! an engine binding implements the trait over its own locker.
//!
//! [`EngineGuard`] ties a held lock to the fiber that took it. It is not
//! `Send`, so the lock cannot wander to another fiber with it; handing the
//! guard to a dispatch is how a caller gives the lock up before parking.

use crate::error::LockError;
use crate::fiber::FiberId;
use parking_lot::{Condvar, Mutex};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Exclusive, non-reentrant lock guarding the engine's execution context.
pub trait EngineLock: Send + Sync {
    /// Park until the lock is free, then take it for the current fiber
    fn acquire(&self) -> Result<(), LockError>;

    /// Release the lock held by the current fiber
    fn release(&self) -> Result<(), LockError>;

    /// Fiber currently holding the lock
    fn holder(&self) -> Option<FiberId>;

    /// Whether the current fiber holds the lock
    fn is_held_by_current(&self) -> bool {
        self.holder() == Some(FiberId::current())
    }
}

/// Fiber-owned exclusive lock.
#[derive(Debug, Default)]
pub struct ExclusiveLock {
    /// Current holder (None if free)
    owner: Mutex<Option<FiberId>>,

    /// Signaled on every release
    released: Condvar,

    /// Total successful acquisitions
    acquisitions: AtomicU64,
}

impl ExclusiveLock {
    /// Create a free lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Total successful acquisitions so far
    pub fn acquisition_count(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }
}

impl EngineLock for ExclusiveLock {
    fn acquire(&self) -> Result<(), LockError> {
        let me = FiberId::current();
        let mut owner = self.owner.lock();
        if *owner == Some(me) {
            return Err(LockError::Reentrant(me));
        }
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        *owner = Some(me);
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release(&self) -> Result<(), LockError> {
        let me = FiberId::current();
        let mut owner = self.owner.lock();
        if *owner != Some(me) {
            return Err(LockError::NotOwner(me));
        }
        *owner = None;
        drop(owner);
        self.released.notify_one();
        Ok(())
    }

    fn holder(&self) -> Option<FiberId> {
        *self.owner.lock()
    }
}

/// Held engine lock; released on drop.
pub struct EngineGuard {
    lock: Arc<dyn EngineLock>,
    released: bool,
    // Fiber-affine: must be released by the fiber that acquired it.
    _not_send: PhantomData<*const ()>,
}

impl EngineGuard {
    /// Acquire `lock` for the current fiber
    pub fn acquire(lock: Arc<dyn EngineLock>) -> Result<Self, LockError> {
        lock.acquire()?;
        Ok(Self {
            lock,
            released: false,
            _not_send: PhantomData,
        })
    }

    /// The lock this guard holds
    pub fn lock(&self) -> &Arc<dyn EngineLock> {
        &self.lock
    }

    /// Release now, reporting protocol errors instead of logging them
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.lock.release()
    }
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.lock.release() {
            warn!(error = %err, "engine guard dropped without holding the lock");
        }
    }
}
