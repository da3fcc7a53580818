//! Seed, cleanup and export tasks and the loop that runs them.
//!
//! A task binds a cache manager, a level list and a coverage. The run loop
//! ([`run_tasks`]) validates each task, takes the cache lock, executes the
//! task and persists its progress:
//!
//! ```text
//! tasks ──► validate ──► try_lock ──busy──► requeue at back
//!              │ error        │ ok
//!              ▼              ▼
//!            skip          execute ──► release lock
//!                             │
//!               ┌─────────────┴───────────────┐
//!               ▼                             ▼
//!    TileWalker + TileWorkerPool    remove_level_tiles_before
//!      (seed, export, cleanup)        (complete-extent cleanup)
//! ```

mod locker;
mod run;

pub use locker::{CacheLock, CacheLocker, LocalCacheLocker, NoopLocker};
pub use run::{
    cleanup, export, run_tasks, seed, RunOptions, RunReport, TaskOutcome,
    DEFAULT_CONCURRENCY, DEFAULT_LOCK_RETRY_DELAY,
};

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cache::{CacheManager, Dimensions};
use crate::coverage::{Coverage, Intersection};
use crate::grid::BBox;
use crate::progress::{ProgressIdentifier, StoreError};
use crate::worker::WorkError;

/// Why a task was skipped, requeued or failed.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Missing coverage or a coverage the grid cannot use. The task is skipped.
    #[error("geometry error: {0}")]
    Geometry(String),

    /// Unusable task settings. The task is skipped.
    #[error("configuration error: {0}")]
    Config(String),

    /// The cache is locked by another task. The task is requeued.
    #[error("cache '{0}' is locked")]
    Lock(String),

    /// The run was cancelled before the task finished.
    #[error("task cancelled")]
    Cancelled,

    /// Progress could not be persisted.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The worker pool could not be started.
    #[error(transparent)]
    Worker(#[from] WorkError),
}

/// Work over one cache, a set of levels and a coverage.
pub trait Task: Send + Sync {
    /// Key for progress persistence and logs.
    fn id(&self) -> &str;

    /// Cache the task writes to or removes from.
    fn manager(&self) -> &Arc<dyn CacheManager>;

    /// Requested levels in ascending order.
    fn levels(&self) -> &[u8];

    fn coverage(&self) -> Option<&Arc<dyn Coverage>>;

    /// Classifies `bbox` (in the grid SRS) against the coverage.
    fn intersects(&self, bbox: &BBox) -> Intersection {
        match self.coverage() {
            Some(coverage) => coverage.intersects(bbox, self.manager().grid().srs()),
            None => Intersection::None,
        }
    }

    /// Checks coverage and levels against the cache grid.
    fn validate(&self) -> Result<(), TaskError> {
        let coverage = self
            .coverage()
            .ok_or_else(|| TaskError::Geometry(format!("task '{}' has no coverage", self.id())))?;
        let grid = self.manager().grid();
        if coverage.srs() != grid.srs() {
            return Err(TaskError::Geometry(format!(
                "coverage SRS {} does not match grid SRS {}",
                coverage.srs(),
                grid.srs()
            )));
        }
        if grid.limit_bbox(&coverage.bbox()).is_none() {
            return Err(TaskError::Geometry(format!(
                "coverage {} lies outside the grid",
                coverage.bbox()
            )));
        }

        let levels = self.levels();
        if levels.is_empty() {
            return Err(TaskError::Config(format!("task '{}' has no levels", self.id())));
        }
        if let Some(level) = levels.iter().find(|l| **l > grid.max_level()) {
            return Err(TaskError::Config(format!(
                "level {} exceeds grid maximum {}",
                level,
                grid.max_level()
            )));
        }
        Ok(())
    }

    /// Executes the task, resuming after `resume` if given.
    fn run(
        &self,
        options: &RunOptions,
        resume: Option<ProgressIdentifier>,
    ) -> Result<TaskOutcome, TaskError>;
}

fn sorted_levels(mut levels: Vec<u8>) -> Vec<u8> {
    levels.sort_unstable();
    levels.dedup();
    levels
}

// ============================================================================
// Seed
// ============================================================================

/// Loads every tile of the coverage into the cache.
pub struct SeedTask {
    id: String,
    manager: Arc<dyn CacheManager>,
    levels: Vec<u8>,
    coverage: Option<Arc<dyn Coverage>>,
    refresh_before: Option<DateTime<Utc>>,
    dimensions: Option<Arc<Dimensions>>,
}

impl SeedTask {
    pub fn new(
        id: impl Into<String>,
        manager: Arc<dyn CacheManager>,
        levels: Vec<u8>,
        coverage: Option<Arc<dyn Coverage>>,
    ) -> Self {
        Self {
            id: id.into(),
            manager,
            levels: sorted_levels(levels),
            coverage,
            refresh_before: None,
            dimensions: None,
        }
    }

    /// Tiles older than `timestamp` are fetched again.
    pub fn with_refresh_before(mut self, timestamp: Option<DateTime<Utc>>) -> Self {
        self.refresh_before = timestamp;
        self
    }

    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = Some(Arc::new(dimensions));
        self
    }

    pub fn refresh_before(&self) -> Option<DateTime<Utc>> {
        self.refresh_before
    }
}

impl Task for SeedTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn manager(&self) -> &Arc<dyn CacheManager> {
        &self.manager
    }

    fn levels(&self) -> &[u8] {
        &self.levels
    }

    fn coverage(&self) -> Option<&Arc<dyn Coverage>> {
        self.coverage.as_ref()
    }

    fn run(
        &self,
        options: &RunOptions,
        resume: Option<ProgressIdentifier>,
    ) -> Result<TaskOutcome, TaskError> {
        run::seed_into(self, self.refresh_before, self.dimensions.clone(), options, resume)
    }
}

// ============================================================================
// Cleanup
// ============================================================================

/// Removes tiles older than a timestamp.
pub struct CleanupTask {
    id: String,
    manager: Arc<dyn CacheManager>,
    levels: Vec<u8>,
    coverage: Option<Arc<dyn Coverage>>,
    remove_before: DateTime<Utc>,
    complete_extent: bool,
}

impl CleanupTask {
    pub fn new(
        id: impl Into<String>,
        manager: Arc<dyn CacheManager>,
        levels: Vec<u8>,
        coverage: Option<Arc<dyn Coverage>>,
        remove_before: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            manager,
            levels: sorted_levels(levels),
            coverage,
            remove_before,
            complete_extent: false,
        }
    }

    /// Marks the coverage as the full grid extent, which allows whole
    /// levels to be purged without walking them.
    pub fn with_complete_extent(mut self, complete: bool) -> Self {
        self.complete_extent = complete;
        self
    }

    pub fn remove_before(&self) -> DateTime<Utc> {
        self.remove_before
    }

    pub fn complete_extent(&self) -> bool {
        self.complete_extent
    }
}

impl fmt::Debug for CleanupTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupTask")
            .field("id", &self.id)
            .field("manager", &self.manager.name())
            .field("levels", &self.levels)
            .field("coverage", &self.coverage)
            .field("remove_before", &self.remove_before)
            .field("complete_extent", &self.complete_extent)
            .finish()
    }
}

impl Task for CleanupTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn manager(&self) -> &Arc<dyn CacheManager> {
        &self.manager
    }

    fn levels(&self) -> &[u8] {
        &self.levels
    }

    fn coverage(&self) -> Option<&Arc<dyn Coverage>> {
        self.coverage.as_ref()
    }

    fn run(
        &self,
        options: &RunOptions,
        resume: Option<ProgressIdentifier>,
    ) -> Result<TaskOutcome, TaskError> {
        run::cleanup_task(self, options, resume)
    }
}

// ============================================================================
// Export
// ============================================================================

/// Copies tiles into another cache.
///
/// The destination manager is expected to fetch from the origin cache
/// (see [`crate::cache::CacheTileSource`]), so exporting is seeding the
/// destination.
pub struct ExportTask {
    id: String,
    destination: Arc<dyn CacheManager>,
    levels: Vec<u8>,
    coverage: Option<Arc<dyn Coverage>>,
    dimensions: Option<Arc<Dimensions>>,
}

impl ExportTask {
    pub fn new(
        id: impl Into<String>,
        destination: Arc<dyn CacheManager>,
        levels: Vec<u8>,
        coverage: Option<Arc<dyn Coverage>>,
    ) -> Self {
        Self {
            id: id.into(),
            destination,
            levels: sorted_levels(levels),
            coverage,
            dimensions: None,
        }
    }

    pub fn with_dimensions(mut self, dimensions: Dimensions) -> Self {
        self.dimensions = Some(Arc::new(dimensions));
        self
    }
}

impl fmt::Debug for ExportTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportTask")
            .field("id", &self.id)
            .field("destination", &self.destination.name())
            .field("levels", &self.levels)
            .field("coverage", &self.coverage)
            .field("dimensions", &self.dimensions.is_some())
            .finish()
    }
}

impl Task for ExportTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn manager(&self) -> &Arc<dyn CacheManager> {
        &self.destination
    }

    fn levels(&self) -> &[u8] {
        &self.levels
    }

    fn coverage(&self) -> Option<&Arc<dyn Coverage>> {
        self.coverage.as_ref()
    }

    fn run(
        &self,
        options: &RunOptions,
        resume: Option<ProgressIdentifier>,
    ) -> Result<TaskOutcome, TaskError> {
        run::seed_into(self, None, self.dimensions.clone(), options, resume)
    }
}
