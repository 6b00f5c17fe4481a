//! Coroutine task integration tests
//!
//! Pool-driven coroutine steps and abort delivery while parked.
//!
//! # Running Tests
//! ```bash
//! cargo test --test cotask_integration
//! ```

mod common;

use skein_dispatch::{
    CoStep, CoTask, Dispatcher, FiberBody, Scheduler, SchedulerError, TaskState, ThreadScheduler,
    WorkerPool,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

struct Flag(Arc<AtomicBool>);

impl Drop for Flag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Counts fibers placed through it
#[derive(Default)]
struct CountingScheduler {
    placed: AtomicUsize,
    inner: ThreadScheduler,
}

impl Scheduler for CountingScheduler {
    fn schedule(&self, name: String, body: FiberBody) -> Result<(), SchedulerError> {
        self.placed.fetch_add(1, Ordering::SeqCst);
        self.inner.schedule(name, body)
    }
}

#[test]
fn test_pool_driven_steps() {
    common::init_tracing();
    let pool = WorkerPool::new(3);
    let co = CoTask::<u32>::new(|scope, ()| {
        scope.yield_value(10)?;
        scope.yield_value(20)?;
        scope.set_result(30);
        Ok(())
    });

    pool.submit(&co).unwrap();
    co.wait_step();
    assert_eq!(co.state(), TaskState::Suspended);
    assert_eq!(co.take_yielded(), Some(10));

    pool.submit(&co).unwrap();
    co.wait_step();
    assert_eq!(co.take_yielded(), Some(20));

    pool.submit(&co).unwrap();
    co.wait_step();
    assert_eq!(co.state(), TaskState::Completed);
    assert_eq!(co.take_yielded(), None);
    assert_eq!(co.take_result(), Ok(Some(30)));

    pool.stop().unwrap();
}

#[test]
fn test_concurrent_coroutines_stepped_on_pool() {
    common::init_tracing();
    let pool = WorkerPool::new(4);
    let coroutines: Vec<_> = (0..8u32)
        .map(|base| {
            CoTask::<u32>::new(move |scope, ()| {
                for i in 0..3 {
                    scope.yield_value(base * 10 + i)?;
                }
                scope.set_result(base);
                Ok(())
            })
        })
        .collect();

    for i in 0..3 {
        for co in &coroutines {
            pool.submit(co).unwrap();
        }
        for (base, co) in coroutines.iter().enumerate() {
            co.wait_step();
            assert_eq!(co.take_yielded(), Some(base as u32 * 10 + i));
        }
    }

    for co in &coroutines {
        pool.submit(co).unwrap();
    }
    for (base, co) in coroutines.iter().enumerate() {
        co.wait_step();
        assert_eq!(co.take_result(), Ok(Some(base as u32)));
    }

    pool.stop().unwrap();
}

#[test]
fn test_drop_while_parked_aborts_once() {
    common::init_tracing();
    let dispatcher = Dispatcher::new(Arc::new(WorkerPool::new(1)));
    let aborts = Arc::new(AtomicUsize::new(0));
    let cleaned = Arc::new(AtomicBool::new(false));

    let co = {
        let aborts = aborts.clone();
        let cleaned = cleaned.clone();
        CoTask::<u32>::new(move |scope, ()| {
            let _flag = Flag(cleaned.clone());
            loop {
                if let Err(err) = scope.yield_value(1) {
                    if err.is_aborted() {
                        aborts.fetch_add(1, Ordering::SeqCst);
                    }
                    // A second yield after the abort fails immediately
                    assert!(scope.yield_value(2).is_err());
                    return Err(err);
                }
            }
        })
    };

    dispatcher.pool().submit(&co).unwrap();
    co.wait_step();
    assert_eq!(co.state(), TaskState::Suspended);

    drop(co);
    assert_eq!(aborts.load(Ordering::SeqCst), 1);
    assert!(cleaned.load(Ordering::SeqCst));

    // Later tasks are unaffected
    assert_eq!(dispatcher.call(|| Ok(5)).unwrap(), 5);
    dispatcher.pool().stop().unwrap();
}

#[test]
fn test_custom_scheduler_places_coroutine_fiber() {
    let scheduler = Arc::new(CountingScheduler::default());
    let co = CoTask::<u32, u32>::with_scheduler(scheduler.clone(), |scope, start| {
        let next = scope.yield_value(start + 1)?;
        scope.set_result(next * 2);
        Ok(())
    });

    assert_eq!(co.call(1).unwrap(), CoStep::Yielded(2));
    assert_eq!(co.call(4).unwrap(), CoStep::Complete);
    assert_eq!(co.take_result(), Ok(Some(8)));

    // Reset reruns on a fresh fiber
    co.reset();
    assert_eq!(co.call(0).unwrap(), CoStep::Yielded(1));
    assert_eq!(scheduler.placed.load(Ordering::SeqCst), 2);
}
