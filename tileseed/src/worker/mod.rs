//! Concurrent execution of tile work.
//!
//! The walker produces [`WorkItem`]s on a single thread; a
//! [`TileWorkerPool`] executes them against the cache manager on a fixed
//! number of OS threads. Failures stay on the item; the pool only reports
//! counters and the first error.

mod item;
mod policy;
mod pool;

pub use item::{WorkError, WorkItem, WorkKind};
pub use policy::{
    RetryPolicy, DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_DELAY_SECS,
};
pub use pool::{PoolConfig, PoolReport, TileWorkerPool, DEFAULT_QUEUE_FACTOR, POLL_INTERVAL};
