//! Bounded pool of worker threads fed by the walking thread.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ process()  ┌─────────────────────────┐
//! │ TileWalker   │───────────►│ queue (VecDeque, FIFO)  │
//! │ (1 thread)   │  blocks    │ parking_lot Mutex       │
//! └──────────────┘  when full └───────────┬─────────────┘
//!                                         │ Condvar
//!                     ┌───────────────────┼───────────────────┐
//!                     ▼                   ▼                   ▼
//!              tile-worker-0       tile-worker-1  ...  tile-worker-N
//!                     │                   │                   │
//!                     └──────── CacheManager I/O ─────────────┘
//! ```
//!
//! Stopping is cooperative: a stopped pool drops queued items, lets
//! in-flight items finish and rejects new ones. Cancelling the token passed
//! in [`PoolConfig`] only rejects new items; whatever is already queued still
//! runs, so every position the walker handed off before the cancel is done.
//!
//! The pool keeps the traversal position of every queued or running item.
//! [`TileWorkerPool::oldest_pending`] is the furthest a resume may skip to
//! while work is in flight. A panic inside the cache manager fails the item
//! and leaves the worker running.

use std::any::Any;
use std::collections::{BTreeMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{RetryPolicy, WorkError, WorkItem};
use crate::progress::{ProgressIdentifier, ProgressLogger, SeedProgress};

/// How often idle workers and a blocked producer re-check the stop token.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Queued items allowed per worker before `process` blocks.
pub const DEFAULT_QUEUE_FACTOR: usize = 2;

/// Settings for [`TileWorkerPool::start_with`].
#[derive(Clone)]
pub struct PoolConfig {
    pub size: usize,
    /// Prefix of the worker thread names.
    pub name: String,
    pub retry_policy: RetryPolicy,
    pub cancel: CancellationToken,
    pub logger: Option<Arc<dyn ProgressLogger>>,
    /// Maximum queued items; `0` means `size * DEFAULT_QUEUE_FACTOR`.
    pub queue_capacity: usize,
}

impl PoolConfig {
    pub fn new(size: usize, name: impl Into<String>) -> Self {
        Self {
            size: size.max(1),
            name: name.into(),
            retry_policy: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            logger: None,
            queue_capacity: 0,
        }
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn ProgressLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    fn capacity(&self) -> usize {
        if self.queue_capacity == 0 {
            self.size * DEFAULT_QUEUE_FACTOR
        } else {
            self.queue_capacity
        }
    }
}

/// Counters returned by [`TileWorkerPool::finish`].
#[derive(Debug, Default)]
pub struct PoolReport {
    /// Items executed successfully.
    pub completed: u64,
    /// Items whose execution recorded an error.
    pub failed: u64,
    /// Items never executed because the pool was stopped.
    pub dropped: u64,
    /// Error of the first failed item.
    pub first_error: Option<WorkError>,
}

impl PoolReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.dropped == 0
    }
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<WorkItem>,
    active: usize,
    /// Positions of queued and running items, with counts.
    pending: BTreeMap<ProgressIdentifier, usize>,
    closed: bool,
    stopped: bool,
    completed: u64,
    failed: u64,
    dropped: u64,
    first_error: Option<WorkError>,
}

struct Shared {
    state: Mutex<PoolState>,
    /// Signalled when an item is queued or the pool closes.
    available: Condvar,
    /// Signalled when a queue slot frees up.
    space: Condvar,
    cancel: CancellationToken,
    retry_policy: RetryPolicy,
}

impl Shared {
    /// True if new items must be rejected.
    fn rejects(&self, state: &PoolState) -> bool {
        state.stopped || self.cancel.is_cancelled()
    }
}

impl PoolState {
    fn track(&mut self, position: &ProgressIdentifier) {
        *self.pending.entry(position.clone()).or_default() += 1;
    }

    fn untrack(&mut self, position: &ProgressIdentifier) {
        if let Some(count) = self.pending.get_mut(position) {
            *count -= 1;
            if *count == 0 {
                self.pending.remove(position);
            }
        }
    }
}

/// Fixed set of worker threads consuming [`WorkItem`]s in FIFO order.
pub struct TileWorkerPool {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    logger: Option<Arc<dyn ProgressLogger>>,
    capacity: usize,
    name: String,
}

impl TileWorkerPool {
    /// Starts `size` workers with default settings.
    pub fn start(size: usize, name: impl Into<String>) -> Result<Self, WorkError> {
        Self::start_with(PoolConfig::new(size, name))
    }

    pub fn start_with(config: PoolConfig) -> Result<Self, WorkError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState::default()),
            available: Condvar::new(),
            space: Condvar::new(),
            cancel: config.cancel.clone(),
            retry_policy: config.retry_policy.clone(),
        });

        let mut pool = Self {
            shared,
            workers: Vec::with_capacity(config.size),
            logger: config.logger.clone(),
            capacity: config.capacity().max(1),
            name: config.name.clone(),
        };

        for i in 0..config.size {
            let shared = Arc::clone(&pool.shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.name, i))
                .spawn(move || worker_loop(shared))
                .map_err(WorkError::Spawn)?;
            pool.workers.push(handle);
        }

        debug!(pool = %pool.name, workers = config.size, capacity = pool.capacity, "Worker pool started");
        Ok(pool)
    }

    /// Queues an item and logs a traversal step.
    ///
    /// The item is tagged with the current traversal position. Blocks while
    /// the queue is full. Returns `false` if the pool was stopped and the
    /// item dropped.
    pub fn process(&self, item: WorkItem, progress: &SeedProgress) -> bool {
        if let Some(logger) = &self.logger {
            logger.log_step(progress);
        }
        let item = item.with_position(ProgressIdentifier::from(progress.current_path().to_vec()));

        let mut state = self.shared.state.lock();
        loop {
            if self.shared.rejects(&state) {
                state.dropped += 1;
                return false;
            }
            if state.queue.len() < self.capacity {
                state.track(item.position());
                state.queue.push_back(item);
                self.shared.available.notify_one();
                return true;
            }
            self.shared.space.wait_for(&mut state, POLL_INTERVAL);
        }
    }

    /// Stops dispatching. In-flight items complete, queued items are dropped.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        self.shared.available.notify_all();
        self.shared.space.notify_all();
    }

    /// True once `stop` was called or the token fired.
    pub fn is_stopped(&self) -> bool {
        let state = self.shared.state.lock();
        self.shared.rejects(&state)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Items currently executing.
    pub fn active(&self) -> usize {
        self.shared.state.lock().active
    }

    /// Smallest traversal position among queued and running items.
    pub fn oldest_pending(&self) -> Option<ProgressIdentifier> {
        self.shared.state.lock().pending.keys().next().cloned()
    }

    /// Waits for the queue to drain and the workers to exit.
    pub fn finish(mut self) -> PoolReport {
        {
            let mut state = self.shared.state.lock();
            state.closed = true;
            self.shared.available.notify_all();
        }
        self.join_workers();

        let mut state = self.shared.state.lock();
        let leftover = state.queue.len() as u64;
        state.queue.clear();
        state.pending.clear();
        let report = PoolReport {
            completed: state.completed,
            failed: state.failed,
            dropped: state.dropped + leftover,
            first_error: state.first_error.take(),
        };
        info!(
            pool = %self.name,
            completed = report.completed,
            failed = report.failed,
            dropped = report.dropped,
            "Worker pool finished"
        );
        report
    }

    fn join_workers(&mut self) {
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!(pool = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for TileWorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.stop();
            self.join_workers();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let mut item = {
            let mut state = shared.state.lock();
            loop {
                if state.stopped {
                    return;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.active += 1;
                    shared.space.notify_one();
                    break item;
                }
                if state.closed || shared.cancel.is_cancelled() {
                    return;
                }
                shared.available.wait_for(&mut state, POLL_INTERVAL);
            }
        };

        let executed = panic::catch_unwind(AssertUnwindSafe(|| {
            item.execute(&shared.retry_policy, &shared.cancel)
        }));
        let ok = match executed {
            Ok(ok) => ok,
            Err(payload) => {
                item.record_panic(panic_message(payload.as_ref()));
                false
            }
        };

        let mut state = shared.state.lock();
        state.active -= 1;
        state.untrack(item.position());
        if ok {
            state.completed += 1;
        } else {
            state.failed += 1;
            if let Some(err) = item.take_error() {
                warn!(task_id = item.task_id().unwrap_or_default(), error = %err, "Work item failed");
                if state.first_error.is_none() {
                    state.first_error = Some(err);
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, CacheManager, Dimensions};
    use crate::grid::{MetaGrid, TileCoord, TileGrid};
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Manager that records loads, optionally sleeping or failing.
    struct SlowManager {
        grid: TileGrid,
        delay: Duration,
        fail_level: Option<u8>,
        panics: bool,
        loads: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl SlowManager {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                grid: TileGrid::web_mercator(8).unwrap(),
                delay,
                fail_level: None,
                panics: false,
                loads: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn failing_at(level: u8) -> Arc<Self> {
            Arc::new(Self {
                grid: TileGrid::web_mercator(8).unwrap(),
                delay: Duration::ZERO,
                fail_level: Some(level),
                panics: false,
                loads: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }

        fn panicking() -> Arc<Self> {
            Arc::new(Self {
                grid: TileGrid::web_mercator(8).unwrap(),
                delay: Duration::ZERO,
                fail_level: None,
                panics: true,
                loads: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            })
        }
    }

    impl CacheManager for SlowManager {
        fn name(&self) -> &str {
            "slow"
        }
        fn grid(&self) -> &TileGrid {
            &self.grid
        }
        fn meta_grid(&self) -> Option<&MetaGrid> {
            None
        }
        fn load_tile_coords(
            &self,
            coords: &[TileCoord],
            _dimensions: Option<&Dimensions>,
            _load_all: bool,
        ) -> Result<usize, CacheError> {
            if self.panics {
                panic!("backend exploded");
            }
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            self.loads.fetch_add(1, Ordering::SeqCst);
            if coords.iter().any(|c| Some(c.z) == self.fail_level) {
                return Err(CacheError::Source("upstream down".to_string()));
            }
            Ok(coords.len())
        }
        fn remove_tile_coords(&self, coords: &[TileCoord]) -> Result<usize, CacheError> {
            Ok(coords.len())
        }
        fn is_cached(&self, _coord: &TileCoord, _dimensions: Option<&Dimensions>) -> bool {
            false
        }
        fn is_stale(&self, _coord: &TileCoord) -> bool {
            false
        }
        fn set_expire_timestamp(&self, _timestamp: Option<DateTime<Utc>>) {}
        fn set_minimize_meta_requests(&self, _minimize: bool) {}
    }

    fn seed_item(manager: &Arc<SlowManager>, z: u8) -> WorkItem {
        let manager: Arc<dyn CacheManager> = manager.clone();
        WorkItem::seed(manager, vec![TileCoord::new(0, 0, z)], false)
    }

    #[test]
    fn test_all_items_complete() {
        let manager = SlowManager::new(Duration::from_millis(1));
        let pool = TileWorkerPool::start(4, "test-worker").unwrap();
        let progress = SeedProgress::new(None);
        for _ in 0..50 {
            assert!(pool.process(seed_item(&manager, 3), &progress));
        }
        let report = pool.finish();
        assert_eq!(report.completed, 50);
        assert_eq!(report.failed, 0);
        assert!(report.is_success());
        assert_eq!(manager.loads.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_concurrency_is_bounded() {
        let manager = SlowManager::new(Duration::from_millis(5));
        let pool = TileWorkerPool::start(3, "bounded").unwrap();
        let progress = SeedProgress::new(None);
        for _ in 0..30 {
            pool.process(seed_item(&manager, 2), &progress);
            assert!(pool.queue_len() <= 3 * DEFAULT_QUEUE_FACTOR);
        }
        pool.finish();
        assert!(manager.max_concurrent.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn test_first_error_is_reported() {
        let manager = SlowManager::failing_at(5);
        let config = PoolConfig::new(2, "failing").with_retry_policy(RetryPolicy::None);
        let pool = TileWorkerPool::start_with(config).unwrap();
        let progress = SeedProgress::new(None);
        pool.process(seed_item(&manager, 4), &progress);
        pool.process(seed_item(&manager, 5), &progress);
        pool.process(seed_item(&manager, 5), &progress);
        let report = pool.finish();

        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 2);
        assert!(matches!(report.first_error, Some(WorkError::Cache { .. })));
    }

    #[test]
    fn test_stop_drops_new_items() {
        let manager = SlowManager::new(Duration::ZERO);
        let pool = TileWorkerPool::start(1, "stopped").unwrap();
        pool.stop();
        assert!(pool.is_stopped());
        assert!(!pool.process(seed_item(&manager, 1), &SeedProgress::new(None)));
        let report = pool.finish();
        assert_eq!(report.dropped, 1);
        assert_eq!(report.completed, 0);
    }

    #[test]
    fn test_cancel_rejects_new_items_but_drains_queue() {
        let manager = SlowManager::new(Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let config = PoolConfig::new(1, "cancel")
            .with_cancel(cancel.clone())
            .with_queue_capacity(100);
        let pool = TileWorkerPool::start_with(config).unwrap();
        let progress = SeedProgress::new(None);
        for _ in 0..20 {
            assert!(pool.process(seed_item(&manager, 1), &progress));
        }
        cancel.cancel();
        assert!(pool.is_stopped());
        assert!(!pool.process(seed_item(&manager, 1), &progress));

        let started = Instant::now();
        let report = pool.finish();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(report.completed, 20);
        assert_eq!(report.dropped, 1);
    }

    #[test]
    fn test_stop_drops_queued_items() {
        let manager = SlowManager::new(Duration::from_millis(20));
        let config = PoolConfig::new(1, "stop-queued").with_queue_capacity(100);
        let pool = TileWorkerPool::start_with(config).unwrap();
        let progress = SeedProgress::new(None);
        for _ in 0..10 {
            pool.process(seed_item(&manager, 1), &progress);
        }
        pool.stop();
        let report = pool.finish();
        assert!(report.dropped > 0);
        assert_eq!(report.completed + report.dropped, 10);
    }

    #[test]
    fn test_panicking_manager_fails_items_without_hanging() {
        let manager = SlowManager::panicking();
        let (tx, rx) = std::sync::mpsc::channel();
        thread::spawn(move || {
            let config = PoolConfig::new(1, "panicking").with_retry_policy(RetryPolicy::None);
            let pool = TileWorkerPool::start_with(config).unwrap();
            let progress = SeedProgress::new(None);
            for _ in 0..5 {
                pool.process(seed_item(&manager, 2), &progress);
            }
            let _ = tx.send(pool.finish());
        });

        let report = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("pool did not finish");
        assert_eq!(report.failed, 5);
        assert_eq!(report.completed, 0);
        match report.first_error {
            Some(WorkError::Panicked { message, .. }) => assert_eq!(message, "backend exploded"),
            other => panic!("unexpected first error: {:?}", other),
        }
    }

    #[test]
    fn test_oldest_pending_tracks_unfinished_positions() {
        let manager = SlowManager::new(Duration::from_millis(200));
        let config = PoolConfig::new(1, "pending").with_queue_capacity(10);
        let pool = TileWorkerPool::start_with(config).unwrap();
        assert_eq!(pool.oldest_pending(), None);

        let mut progress = SeedProgress::new(None);
        progress.step_down(1, 4);
        pool.process(seed_item(&manager, 1), &progress);
        progress.step_up();
        progress.step_down(2, 4);
        pool.process(seed_item(&manager, 1), &progress);

        assert_eq!(
            pool.oldest_pending(),
            Some(ProgressIdentifier::from(vec![(1, 4)]))
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.oldest_pending().is_some() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.oldest_pending(), None);
        assert_eq!(pool.finish().completed, 2);
    }
}
