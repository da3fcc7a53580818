//! Task execution and the multi-task run loop.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{CacheLocker, CleanupTask, ExportTask, NoopLocker, SeedTask, Task, TaskError};
use crate::cache::Dimensions;
use crate::progress::{ProgressIdentifier, ProgressLogger, ProgressStore, SeedProgress};
use crate::walker::{TileWalker, WalkSummary, WalkerConfig};
use crate::worker::{PoolConfig, RetryPolicy, TileWorkerPool, POLL_INTERVAL};

/// Worker threads per task when not configured.
pub const DEFAULT_CONCURRENCY: usize = 2;

/// Pause after a round in which every remaining task found its cache locked.
pub const DEFAULT_LOCK_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Prefix of worker thread names.
const WORKER_THREAD_NAME: &str = "tile-worker";

/// Settings shared by all tasks of one run.
#[derive(Clone)]
pub struct RunOptions {
    pub concurrency: usize,
    /// See [`WalkerConfig::skip_geoms_for_last_levels`].
    pub skip_geoms_for_last_levels: usize,
    pub logger: Option<Arc<dyn ProgressLogger>>,
    pub store: Option<Arc<dyn ProgressStore>>,
    pub cancel: CancellationToken,
    pub retry_policy: RetryPolicy,
    pub lock_retry_delay: Duration,
    pub locker: Arc<dyn CacheLocker>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            skip_geoms_for_last_levels: 0,
            logger: None,
            store: None,
            cancel: CancellationToken::new(),
            retry_policy: RetryPolicy::default(),
            lock_retry_delay: DEFAULT_LOCK_RETRY_DELAY,
            locker: Arc::new(NoopLocker),
        }
    }
}

impl RunOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_skip_geoms_for_last_levels(mut self, levels: usize) -> Self {
        self.skip_geoms_for_last_levels = levels;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn ProgressLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_lock_retry_delay(mut self, delay: Duration) -> Self {
        self.lock_retry_delay = delay;
        self
    }

    pub fn with_locker(mut self, locker: Arc<dyn CacheLocker>) -> Self {
        self.locker = locker;
        self
    }
}

/// Result of one task execution.
#[derive(Debug, Default)]
pub struct TaskOutcome {
    /// Walk statistics, `None` for the level-removal fast path.
    pub walk: Option<WalkSummary>,
    /// Work items or level removals that succeeded.
    pub completed: u64,
    /// Work items or level removals that failed.
    pub failed: u64,
    /// Tiles removed per level by the fast path.
    pub removed_levels: Vec<(u8, usize)>,
    /// Position to resume from if cancelled.
    pub identifier: ProgressIdentifier,
    pub cancelled: bool,
}

/// Summary of a [`run_tasks`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Tasks that finished without failed work.
    pub completed: usize,
    /// Tasks not run: invalid, or left over after a cancel.
    pub skipped: usize,
    /// Tasks that errored or had failed work items.
    pub failed: usize,
    /// Work items dispatched over all tasks.
    pub dispatched: u64,
    pub cancelled: bool,
}

/// Seeds every task.
pub fn seed(tasks: Vec<SeedTask>, options: &RunOptions) -> RunReport {
    run_tasks(tasks, options)
}

/// Cleans up every task.
pub fn cleanup(tasks: Vec<CleanupTask>, options: &RunOptions) -> RunReport {
    run_tasks(tasks, options)
}

/// Exports every task.
pub fn export(tasks: Vec<ExportTask>, options: &RunOptions) -> RunReport {
    run_tasks(tasks, options)
}

/// Runs tasks in order.
///
/// Invalid tasks are skipped. A task whose cache is locked goes to the back
/// of the queue; after a full round of locked caches the loop pauses for
/// `lock_retry_delay`. A cancel stops the loop after the running task.
pub fn run_tasks<T: Task>(tasks: Vec<T>, options: &RunOptions) -> RunReport {
    let mut report = RunReport::default();
    let mut queue: VecDeque<T> = tasks.into_iter().collect();
    let mut busy = 0usize;

    while let Some(task) = queue.pop_front() {
        if options.cancel.is_cancelled() {
            report.cancelled = true;
            report.skipped += 1 + queue.len();
            break;
        }

        if let Err(e) = task.validate() {
            warn!(task_id = task.id(), error = %e, "Skipping task");
            report.skipped += 1;
            continue;
        }

        let lock = match options.locker.try_lock(task.manager().name()) {
            Ok(lock) => lock,
            Err(TaskError::Lock(cache)) => {
                debug!(task_id = task.id(), cache = %cache, "Cache busy, requeueing task");
                queue.push_back(task);
                busy += 1;
                if busy >= queue.len() {
                    pause(options.lock_retry_delay, &options.cancel);
                    busy = 0;
                }
                continue;
            }
            Err(e) => {
                error!(task_id = task.id(), error = %e, "Cannot lock cache");
                report.failed += 1;
                continue;
            }
        };
        busy = 0;

        execute(&task, options, &mut report);
        drop(lock);
    }

    info!(
        completed = report.completed,
        skipped = report.skipped,
        failed = report.failed,
        dispatched = report.dispatched,
        cancelled = report.cancelled,
        "Run finished"
    );
    report
}

fn execute<T: Task>(task: &T, options: &RunOptions, report: &mut RunReport) {
    if let Some(logger) = &options.logger {
        logger.set_current_task_id(task.id());
    }

    let resume = options
        .store
        .as_ref()
        .and_then(|store| store.get(task.id()))
        .filter(|id| !id.is_empty());
    if let Some(id) = &resume {
        info!(task_id = task.id(), from = %id, "Resuming task");
    }
    info!(
        task_id = task.id(),
        cache = task.manager().name(),
        levels = ?task.levels(),
        "Starting task"
    );

    let started = Instant::now();
    match task.run(options, resume) {
        Ok(outcome) => {
            if let Some(walk) = &outcome.walk {
                report.dispatched += walk.dispatched;
            }
            if let Some(store) = &options.store {
                persist(store.as_ref(), task.id(), &outcome);
            }

            if outcome.cancelled {
                report.cancelled = true;
                report.skipped += 1;
            } else if outcome.failed > 0 {
                warn!(task_id = task.id(), failed = outcome.failed, "Task finished with failures");
                report.failed += 1;
            } else {
                report.completed += 1;
            }
            info!(
                task_id = task.id(),
                completed = outcome.completed,
                failed = outcome.failed,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Task done"
            );
        }
        Err(TaskError::Cancelled) => {
            report.cancelled = true;
            report.skipped += 1;
        }
        Err(e) => {
            error!(task_id = task.id(), error = %e, "Task failed");
            report.failed += 1;
        }
    }
}

/// Keeps the identifier of an interrupted task, forgets a finished one.
fn persist(store: &dyn ProgressStore, task_id: &str, outcome: &TaskOutcome) {
    if outcome.cancelled && !outcome.identifier.is_empty() {
        store.store(task_id, outcome.identifier.clone());
    } else {
        store.remove(task_id);
    }
    if let Err(e) = store.save() {
        warn!(task_id, error = %e, "Failed to save progress");
    }
}

/// Sleeps up to `delay`, waking early on cancel.
fn pause(delay: Duration, cancel: &CancellationToken) {
    let deadline = Instant::now() + delay;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(POLL_INTERVAL));
    }
}

// ============================================================================
// Task bodies
// ============================================================================

/// Seeds the task's manager. Shared by seed and export tasks.
pub(super) fn seed_into(
    task: &dyn Task,
    refresh_before: Option<DateTime<Utc>>,
    dimensions: Option<Arc<Dimensions>>,
    options: &RunOptions,
    resume: Option<ProgressIdentifier>,
) -> Result<TaskOutcome, TaskError> {
    let manager = task.manager();
    manager.set_expire_timestamp(refresh_before);
    manager.set_minimize_meta_requests(false);

    let config = WalkerConfig::seed(task.levels().to_vec())
        .with_work_on_metatiles(!manager.rescales_tiles())
        .with_skip_geoms_for_last_levels(options.skip_geoms_for_last_levels)
        .with_handle_uncached(refresh_before.is_some())
        .with_dimensions(dimensions);
    walk_task(task, config, options, resume)
}

pub(super) fn cleanup_task(
    task: &CleanupTask,
    options: &RunOptions,
    resume: Option<ProgressIdentifier>,
) -> Result<TaskOutcome, TaskError> {
    let manager = task.manager();

    let outcome = if task.complete_extent() && manager.supports_level_removal() {
        let mut outcome = TaskOutcome::default();
        for &level in task.levels() {
            if options.cancel.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
            match manager.remove_level_tiles_before(level, task.remove_before()) {
                Ok(removed) => {
                    info!(task_id = task.id(), level, removed, "Removed level");
                    outcome.completed += 1;
                    outcome.removed_levels.push((level, removed));
                }
                Err(e) => {
                    warn!(task_id = task.id(), level, error = %e, "Level removal failed");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    } else {
        manager.set_expire_timestamp(Some(task.remove_before()));
        let config = WalkerConfig::cleanup(task.levels().to_vec())
            .with_work_on_metatiles(false)
            .with_skip_geoms_for_last_levels(options.skip_geoms_for_last_levels);
        walk_task(task, config, options, resume)?
    };

    if let Err(e) = manager.cleanup() {
        debug!(task_id = task.id(), error = %e, "Cache cleanup hook failed");
    }
    Ok(outcome)
}

/// Walks the task's coverage with a fresh worker pool.
fn walk_task(
    task: &dyn Task,
    config: WalkerConfig,
    options: &RunOptions,
    resume: Option<ProgressIdentifier>,
) -> Result<TaskOutcome, TaskError> {
    let coverage = task
        .coverage()
        .cloned()
        .ok_or_else(|| TaskError::Geometry(format!("task '{}' has no coverage", task.id())))?;

    let mut pool_config = PoolConfig::new(options.concurrency, WORKER_THREAD_NAME)
        .with_retry_policy(options.retry_policy.clone())
        .with_cancel(options.cancel.clone());
    if let Some(logger) = &options.logger {
        pool_config = pool_config.with_logger(Arc::clone(logger));
    }
    let pool = TileWorkerPool::start_with(pool_config)?;

    let mut walker = TileWalker::new(Arc::clone(task.manager()), coverage, &pool, config)
        .with_progress(SeedProgress::new(resume))
        .with_cancel(options.cancel.clone())
        .with_task_id(Arc::from(task.id()));
    if let Some(logger) = &options.logger {
        walker = walker.with_logger(Arc::clone(logger));
    }

    let summary = walker.walk();
    let identifier = walker.progress().current_progress_identifier();
    drop(walker);
    let report = pool.finish();

    if let Some(err) = &report.first_error {
        warn!(task_id = task.id(), error = %err, failed = report.failed, "Work items failed");
    }

    Ok(TaskOutcome {
        cancelled: summary.cancelled,
        completed: report.completed,
        failed: report.failed,
        removed_levels: Vec::new(),
        identifier,
        walk: Some(summary),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheError, CacheManager, DiskCacheManager, TileSource};
    use crate::coverage::{BBoxCoverage, Coverage};
    use crate::grid::{BBox, TileCoord, TileGrid, WEB_MERCATOR_EXTENT, WEB_MERCATOR_SRS};
    use crate::progress::JsonProgressStore;
    use crate::task::{CacheLock, LocalCacheLocker};
    use tempfile::TempDir;

    struct StaticSource;

    impl TileSource for StaticSource {
        fn name(&self) -> &str {
            "static"
        }

        fn fetch(
            &self,
            _coord: &TileCoord,
            _dimensions: Option<&Dimensions>,
        ) -> Result<Vec<u8>, CacheError> {
            Ok(b"tile".to_vec())
        }
    }

    fn disk_cache(dir: &TempDir, name: &str) -> Arc<DiskCacheManager> {
        Arc::new(
            DiskCacheManager::new(name, dir.path().join(name), TileGrid::web_mercator(6).unwrap())
                .with_source(Arc::new(StaticSource)),
        )
    }

    fn world() -> Arc<dyn Coverage> {
        let e = WEB_MERCATOR_EXTENT;
        Arc::new(BBoxCoverage::new(
            BBox::new(-e, -e, e, e).unwrap(),
            WEB_MERCATOR_SRS,
        ))
    }

    fn options() -> RunOptions {
        RunOptions::default()
            .with_concurrency(2)
            .with_retry_policy(RetryPolicy::None)
            .with_lock_retry_delay(Duration::from_millis(10))
    }

    #[test]
    fn test_seed_writes_all_tiles() {
        let dir = TempDir::new().unwrap();
        let cache = disk_cache(&dir, "osm");
        let task = SeedTask::new("world", cache.clone(), vec![0, 1, 2], Some(world()));

        let report = seed(vec![task], &options());
        assert_eq!(report.completed, 1);
        assert_eq!(report.dispatched, 21);
        for z in 0..=2u8 {
            let n = 1u32 << z;
            for x in 0..n {
                for y in 0..n {
                    assert!(cache.tile_path(&TileCoord::new(x, y, z)).exists());
                }
            }
        }
    }

    #[test]
    fn test_invalid_task_is_skipped_others_run() {
        let dir = TempDir::new().unwrap();
        let cache = disk_cache(&dir, "osm");
        let bad = SeedTask::new("bad", cache.clone(), vec![0], None);
        let good = SeedTask::new("good", cache.clone(), vec![0], Some(world()));

        let report = seed(vec![bad, good], &options());
        assert_eq!(report.skipped, 1);
        assert_eq!(report.completed, 1);
    }

    #[test]
    fn test_locked_cache_is_requeued() {
        let dir = TempDir::new().unwrap();
        let cache = disk_cache(&dir, "osm");
        let other = disk_cache(&dir, "aerial");
        let locker = LocalCacheLocker::new();
        let held = locker.try_lock("osm").unwrap();

        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            drop(held);
        });

        let tasks = vec![
            SeedTask::new("first", cache.clone(), vec![0], Some(world())),
            SeedTask::new("second", other.clone(), vec![0], Some(world())),
        ];
        let report = seed(tasks, &options().with_locker(Arc::new(locker.clone())));
        release.join().unwrap();

        assert_eq!(report.completed, 2);
        assert!(cache.tile_path(&TileCoord::new(0, 0, 0)).exists());
        assert!(!locker.is_locked("osm"));
        assert!(!locker.is_locked("aerial"));
    }

    /// Locker whose backend is broken for one cache.
    struct BrokenLocker;

    impl CacheLocker for BrokenLocker {
        fn try_lock(&self, name: &str) -> Result<CacheLock, TaskError> {
            if name == "osm" {
                return Err(TaskError::Config("lock directory not writable".to_string()));
            }
            NoopLocker.try_lock(name)
        }
    }

    #[test]
    fn test_lock_failure_fails_task_instead_of_requeueing() {
        let dir = TempDir::new().unwrap();
        let cache = disk_cache(&dir, "osm");
        let other = disk_cache(&dir, "aerial");
        let tasks = vec![
            SeedTask::new("first", cache.clone(), vec![0], Some(world())),
            SeedTask::new("second", other.clone(), vec![0], Some(world())),
        ];

        let started = Instant::now();
        let report = seed(tasks, &options().with_locker(Arc::new(BrokenLocker)));

        assert!(started.elapsed() < DEFAULT_LOCK_RETRY_DELAY);
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);
        assert!(!cache.tile_path(&TileCoord::new(0, 0, 0)).exists());
        assert!(other.tile_path(&TileCoord::new(0, 0, 0)).exists());
    }

    #[test]
    fn test_cancelled_before_start_skips_everything() {
        let dir = TempDir::new().unwrap();
        let cache = disk_cache(&dir, "osm");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let tasks = vec![
            SeedTask::new("a", cache.clone(), vec![0], Some(world())),
            SeedTask::new("b", cache.clone(), vec![0], Some(world())),
        ];
        let report = seed(tasks, &options().with_cancel(cancel));
        assert!(report.cancelled);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.completed, 0);
    }

    #[test]
    fn test_completed_task_is_removed_from_store() {
        let dir = TempDir::new().unwrap();
        let cache = disk_cache(&dir, "osm");
        let path = dir.path().join("progress.json");
        let store = Arc::new(JsonProgressStore::open(&path).unwrap());
        store.store("world", ProgressIdentifier::from(vec![(0, 1), (2, 4)]));

        let task = SeedTask::new("world", cache, vec![0, 1], Some(world()));
        let report = seed(vec![task], &options().with_store(store.clone()));

        assert_eq!(report.completed, 1);
        assert_eq!(store.get("world"), None);
        assert!(JsonProgressStore::open(&path).unwrap().is_empty());
        // [(0,1),(0,4)] and [(0,1),(1,4)] were skipped
        assert_eq!(report.dispatched, 3);
    }

    #[test]
    fn test_refresh_before_reloads_old_tiles_only() {
        let dir = TempDir::new().unwrap();
        let cache = disk_cache(&dir, "osm");
        let old = TileCoord::new(0, 0, 1);
        let fresh = TileCoord::new(1, 0, 1);
        cache.write_tile(&old, b"old").unwrap();
        cache.write_tile(&fresh, b"fresh").unwrap();
        filetime::set_file_mtime(
            cache.tile_path(&old),
            filetime::FileTime::from_unix_time(1_000_000, 0),
        )
        .unwrap();

        let task = SeedTask::new("refresh", cache.clone(), vec![1], Some(world()))
            .with_refresh_before(Some(Utc::now() - chrono::Duration::hours(1)));
        let report = seed(vec![task], &options());

        assert_eq!(report.completed, 1);
        // the old tile and the two missing ones
        assert_eq!(report.dispatched, 3);
        assert_eq!(cache.read_tile(&old).unwrap(), b"tile");
        assert_eq!(cache.read_tile(&fresh).unwrap(), b"fresh");
    }

    #[test]
    fn test_cleanup_walk_removes_stale_tiles() {
        let dir = TempDir::new().unwrap();
        let cache = disk_cache(&dir, "osm");
        let stale = TileCoord::new(0, 0, 1);
        let fresh = TileCoord::new(1, 1, 1);
        cache.write_tile(&stale, b"x").unwrap();
        cache.write_tile(&fresh, b"x").unwrap();
        filetime::set_file_mtime(
            cache.tile_path(&stale),
            filetime::FileTime::from_unix_time(1_000_000, 0),
        )
        .unwrap();

        let task = CleanupTask::new(
            "purge",
            cache.clone(),
            vec![1],
            Some(world()),
            Utc::now() - chrono::Duration::hours(1),
        );
        let report = cleanup(vec![task], &options());

        assert_eq!(report.completed, 1);
        assert_eq!(report.dispatched, 1);
        assert!(!cache.tile_path(&stale).exists());
        assert!(cache.tile_path(&fresh).exists());
    }

    #[test]
    fn test_export_copies_from_origin() {
        let dir = TempDir::new().unwrap();
        let origin = disk_cache(&dir, "origin");
        let destination: Arc<dyn CacheManager> = Arc::new(
            DiskCacheManager::new(
                "copy",
                dir.path().join("copy"),
                TileGrid::web_mercator(6).unwrap(),
            )
            .with_source(Arc::new(crate::cache::CacheTileSource::new(origin.clone()))),
        );

        let task = ExportTask::new("export", destination, vec![0, 1], Some(world()));
        let report = export(vec![task], &options());

        assert_eq!(report.completed, 1);
        assert!(origin.tile_path(&TileCoord::new(1, 1, 1)).exists());
        assert!(dir.path().join("copy/1/1/1.png").exists());
    }
}
