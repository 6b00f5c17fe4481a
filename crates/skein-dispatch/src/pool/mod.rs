//! Fixed-size pool of worker fibers draining one shared task queue

#[allow(clippy::module_inception)]
mod pool;
mod worker;

pub use pool::{resolve_pool_size, PoolStats, WorkerPool, MAX_POOL_SIZE};
pub(crate) use pool::DEFAULT_NAME_PREFIX;
