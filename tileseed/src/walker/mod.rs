//! Depth-first traversal of the tile pyramid.
//!
//! The walker starts with the coverage extent at level 0 and descends level
//! by level, only into meta-tiles the coverage touches. Every requested level
//! is dispatched to the worker pool, children before parents:
//!
//! ```text
//! level 0        ┌───────────────┐            dispatched last
//!                │       A       │
//!                └───────┬───────┘
//! level 1    ┌─────┬─────┼─────┬─────┐
//!            │ A0  │ A1  │ A2  │ A3  │        each after its subtree
//!            └──┬──┴─────┴─────┴─────┘
//! level 2    ┌──┴──┬─────┬─────┐
//!            │A00  │A01  │ ... │              leaves first
//!            └─────┴─────┴─────┘
//! ```
//!
//! The traversal keeps an explicit stack of frames instead of recursing.
//! Each frame owns the classified children of one meta-tile; the
//! [`SeedProgress`] path mirrors the stack so an interrupted walk can resume
//! by skipping finished subtrees.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{CacheManager, Dimensions};
use crate::coverage::{Coverage, Intersection};
use crate::grid::{BBox, MetaGrid, TileCoord};
use crate::progress::{ProgressLogger, SeedProgress};
use crate::worker::{TileWorkerPool, WorkItem, WorkKind};

/// Dispatches between two calls of the manager cleanup hook.
pub const DEFAULT_CLEANUP_INTERVAL: u64 = 1000;

/// Fraction of the requested level list up to which levels are reported.
const REPORT_LEVEL_FRACTION: f64 = 0.8;

/// Meta-tiles remembered per level to suppress repeated dispatches.
///
/// Repeats only come from buffered neighbours reached through an adjacent
/// parent, which the depth-first order visits shortly after.
pub const RECENT_TILES_WINDOW: usize = 64;

/// What a walk does and how it filters tiles.
#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Levels to dispatch.
    pub levels: Vec<u8>,
    pub kind: WorkKind,
    /// Dispatch whole meta-tiles instead of single tiles.
    pub work_on_metatiles: bool,
    /// Skip coverage tests once this many requested levels or fewer remain.
    /// `0` disables.
    pub skip_geoms_for_last_levels: usize,
    /// Only dispatch tiles the manager does not have.
    pub handle_uncached: bool,
    /// Only dispatch tiles the manager reports as stale.
    pub handle_stale: bool,
    pub dimensions: Option<Arc<Dimensions>>,
    /// `0` disables the periodic cleanup hook.
    pub cleanup_interval: u64,
}

impl WalkerConfig {
    /// Seeding walk over `levels`.
    pub fn seed(levels: Vec<u8>) -> Self {
        Self::new(levels, WorkKind::Seed)
    }

    /// Tile-by-tile cleanup walk over `levels`, removing stale tiles.
    pub fn cleanup(levels: Vec<u8>) -> Self {
        Self {
            handle_stale: true,
            ..Self::new(levels, WorkKind::Cleanup)
        }
    }

    fn new(mut levels: Vec<u8>, kind: WorkKind) -> Self {
        levels.sort_unstable();
        levels.dedup();
        Self {
            levels,
            kind,
            work_on_metatiles: true,
            skip_geoms_for_last_levels: 0,
            handle_uncached: false,
            handle_stale: false,
            dimensions: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }

    pub fn with_work_on_metatiles(mut self, enabled: bool) -> Self {
        self.work_on_metatiles = enabled;
        self
    }

    pub fn with_skip_geoms_for_last_levels(mut self, levels: usize) -> Self {
        self.skip_geoms_for_last_levels = levels;
        self
    }

    pub fn with_handle_uncached(mut self, enabled: bool) -> Self {
        self.handle_uncached = enabled;
        self
    }

    pub fn with_dimensions(mut self, dimensions: Option<Arc<Dimensions>>) -> Self {
        self.dimensions = dimensions;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: u64) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Deepest level that still gets a progress report.
    pub fn report_till_level(&self) -> Option<u8> {
        let idx = (self.levels.len() as f64 * REPORT_LEVEL_FRACTION) as usize;
        self.levels
            .get(idx.min(self.levels.len().saturating_sub(1)))
            .copied()
    }
}

/// Outcome of [`TileWalker::walk`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WalkSummary {
    /// Work items handed to the pool.
    pub dispatched: u64,
    /// Work items per level.
    pub levels: BTreeMap<u8, u64>,
    /// True if the walk stopped because of the cancellation token.
    pub cancelled: bool,
}

/// Non-NONE child of a frame.
#[derive(Debug, Clone, Copy)]
struct Child {
    coord: TileCoord,
    bbox: BBox,
    all_subtiles: bool,
}

/// Bounded memory of recently dispatched meta-tiles of one level.
#[derive(Debug, Default)]
struct RecentTiles {
    tiles: VecDeque<TileCoord>,
}

impl RecentTiles {
    /// Remembers `coord`. Returns `false` if it was already in the window.
    fn insert(&mut self, coord: TileCoord) -> bool {
        if self.tiles.contains(&coord) {
            return false;
        }
        if self.tiles.len() >= RECENT_TILES_WINDOW {
            self.tiles.pop_front();
        }
        self.tiles.push_back(coord);
        true
    }
}

/// One expanded meta-tile on the traversal stack.
struct Frame {
    bbox: BBox,
    level: u8,
    /// Dispatch this frame's children.
    process: bool,
    /// Requested levels below this one.
    child_levels: Vec<u8>,
    children: Vec<Option<Child>>,
    next: usize,
    /// Child whose subtree is on the stack above this frame.
    pending: Option<TileCoord>,
}

/// Single-threaded traversal feeding a [`TileWorkerPool`].
pub struct TileWalker<'a> {
    manager: Arc<dyn CacheManager>,
    coverage: Arc<dyn Coverage>,
    pool: &'a TileWorkerPool,
    config: WalkerConfig,
    meta_grid: MetaGrid,
    progress: SeedProgress,
    logger: Option<Arc<dyn ProgressLogger>>,
    cancel: CancellationToken,
    task_id: Option<Arc<str>>,
    report_till_level: Option<u8>,
    seeded: HashMap<u8, RecentTiles>,
    summary: WalkSummary,
}

impl<'a> TileWalker<'a> {
    /// Creates a walker. Meta-tiles come from the manager when
    /// `work_on_metatiles` is set and the manager has a meta grid; otherwise
    /// every tile is its own batch.
    pub fn new(
        manager: Arc<dyn CacheManager>,
        coverage: Arc<dyn Coverage>,
        pool: &'a TileWorkerPool,
        config: WalkerConfig,
    ) -> Self {
        let meta_grid = match manager.meta_grid() {
            Some(meta) if config.work_on_metatiles => meta.clone(),
            _ => MetaGrid::single(manager.grid().clone()),
        };
        let report_till_level = config.report_till_level();
        Self {
            manager,
            coverage,
            pool,
            config,
            meta_grid,
            progress: SeedProgress::new(None),
            logger: None,
            cancel: CancellationToken::new(),
            task_id: None,
            report_till_level,
            seeded: HashMap::new(),
            summary: WalkSummary::default(),
        }
    }

    /// Resumes from (or starts with) the given progress.
    pub fn with_progress(mut self, progress: SeedProgress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn ProgressLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_task_id(mut self, task_id: Arc<str>) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn progress(&self) -> &SeedProgress {
        &self.progress
    }

    pub fn into_progress(self) -> SeedProgress {
        self.progress
    }

    /// Walks the whole pyramid. Never fails: grid errors end the affected
    /// branch and work failures stay on the work items.
    pub fn walk(&mut self) -> WalkSummary {
        let grid = self.meta_grid.grid();
        let Some(root_bbox) = grid.limit_bbox(&self.coverage.bbox()) else {
            debug!(task_id = self.task_id(), "Coverage outside grid, nothing to walk");
            return self.summary.clone();
        };
        if self.config.levels.is_empty() {
            return self.summary.clone();
        }

        let root = self.expand(root_bbox, 0, self.config.levels.clone(), false);
        let mut stack = vec![root];

        while !stack.is_empty() {
            if self.cancel.is_cancelled() {
                info!(
                    task_id = self.task_id(),
                    path = %self.progress.progress_string(),
                    "Walk cancelled"
                );
                self.summary.cancelled = true;
                break;
            }

            let Some(frame) = stack.last_mut() else {
                break;
            };

            if frame.next >= frame.children.len() {
                stack.pop();
                if let Some(parent) = stack.last_mut() {
                    if let Some(coord) = parent.pending.take() {
                        if parent.process {
                            self.dispatch(coord);
                        }
                    }
                    self.progress.step_up();
                }
                continue;
            }

            let index = frame.next;
            frame.next += 1;
            let total = frame.children.len() as u32;

            let Some(child) = frame.children[index] else {
                self.progress.step_forward(total);
                continue;
            };

            self.progress.step_down(index as u32, total);
            if self.progress.already_processed() {
                self.progress.step_forward(1);
                self.progress.step_up();
                continue;
            }

            if frame.child_levels.is_empty() {
                let process = frame.process;
                self.progress.step_forward(1);
                if process {
                    self.dispatch(child.coord);
                }
                self.progress.step_up();
                continue;
            }

            frame.pending = Some(child.coord);
            let bbox = frame.bbox.intersection(&child.bbox).unwrap_or(child.bbox);
            let levels = frame.child_levels.clone();
            let level = frame.level + 1;

            let next = self.expand(bbox, level, levels, child.all_subtiles);
            if next.children.is_empty() {
                self.progress.step_forward(1);
            }
            stack.push(next);
        }

        // the caller drains the pool before persisting the final position
        self.progress.set_in_flight(None);

        debug!(
            task_id = self.task_id(),
            dispatched = self.summary.dispatched,
            cancelled = self.summary.cancelled,
            "Walk finished"
        );
        self.summary.clone()
    }

    /// Queries and classifies the meta-tiles of `bbox` at `level`.
    fn expand(&mut self, bbox: BBox, level: u8, levels: Vec<u8>, all_subtiles: bool) -> Frame {
        let process = levels.contains(&level);
        let skip_geoms = self.config.skip_geoms_for_last_levels > 0
            && levels.len() <= self.config.skip_geoms_for_last_levels;
        let child_levels: Vec<u8> = levels.iter().copied().filter(|l| *l != level).collect();

        let mut frame = Frame {
            bbox,
            level,
            process,
            child_levels,
            children: Vec::new(),
            next: 0,
            pending: None,
        };

        let affected = match self.meta_grid.get_affected_level_tiles(&bbox, level) {
            Ok(affected) => affected,
            Err(e) => {
                warn!(task_id = self.task_id(), level, error = %e, "Cannot expand level");
                return frame;
            }
        };

        if process && self.report_till_level.is_some_and(|r| level <= r) {
            if let Some(logger) = &self.logger {
                self.progress.set_in_flight(self.pool.oldest_pending());
                let extent = affected.bbox.unwrap_or(bbox);
                logger.log_progress(&self.progress, level, &extent, affected.total() as u64);
            }
        }

        let all_subtiles = all_subtiles || skip_geoms;
        frame.children = affected
            .tiles
            .map(|coord| self.classify(coord, all_subtiles))
            .collect();
        frame
    }

    fn classify(&self, coord: TileCoord, all_subtiles: bool) -> Option<Child> {
        let bbox = self.meta_grid.meta_bbox(&coord, true).ok()?;
        if all_subtiles {
            return Some(Child {
                coord,
                bbox,
                all_subtiles: true,
            });
        }
        match self.coverage.intersects(&bbox, self.meta_grid.grid().srs()) {
            Intersection::None => None,
            Intersection::Intersects => Some(Child {
                coord,
                bbox,
                all_subtiles: false,
            }),
            Intersection::Contains => Some(Child {
                coord,
                bbox,
                all_subtiles: true,
            }),
        }
    }

    /// Hands the batch of `coord` to the pool unless it was dispatched
    /// recently.
    fn dispatch(&mut self, coord: TileCoord) {
        if !self.seeded.entry(coord.z).or_default().insert(coord) {
            return;
        }

        let mut tiles = if self.config.work_on_metatiles {
            match self.meta_grid.tile_list(&coord) {
                Ok(tiles) => tiles,
                Err(e) => {
                    warn!(task_id = self.task_id(), tile = %coord, error = %e, "Invalid meta-tile");
                    return;
                }
            }
        } else {
            vec![coord]
        };

        let dims = self.config.dimensions.as_deref();
        if self.config.handle_uncached {
            tiles.retain(|t| !self.manager.is_cached(t, dims));
        }
        if self.config.handle_stale {
            tiles.retain(|t| self.manager.is_stale(t));
        }
        if tiles.is_empty() {
            return;
        }

        let item = match self.config.kind {
            WorkKind::Seed => WorkItem::seed(
                Arc::clone(&self.manager),
                tiles,
                self.config.work_on_metatiles,
            ),
            WorkKind::Cleanup => WorkItem::cleanup(Arc::clone(&self.manager), tiles),
        };
        let item = match &self.task_id {
            Some(id) => item.with_task_id(Arc::clone(id)),
            None => item,
        }
        .with_dimensions(self.config.dimensions.clone());

        if !self.pool.process(item, &self.progress) {
            return;
        }

        self.summary.dispatched += 1;
        *self.summary.levels.entry(coord.z).or_default() += 1;

        let interval = self.config.cleanup_interval;
        if interval > 0 && self.summary.dispatched % interval == 0 {
            if let Err(e) = self.manager.cleanup() {
                debug!(task_id = self.task_id(), error = %e, "Cache cleanup hook failed");
            }
        }
    }

    fn task_id(&self) -> &str {
        self.task_id.as_deref().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_sorts_and_dedups_levels() {
        let config = WalkerConfig::seed(vec![3, 1, 2, 1]);
        assert_eq!(config.levels, vec![1, 2, 3]);
        assert_eq!(config.kind, WorkKind::Seed);
        assert!(!config.handle_stale);
    }

    #[test]
    fn test_cleanup_config_handles_stale() {
        let config = WalkerConfig::cleanup(vec![0, 1]);
        assert_eq!(config.kind, WorkKind::Cleanup);
        assert!(config.handle_stale);
    }

    #[test]
    fn test_recent_tiles_window() {
        let mut recent = RecentTiles::default();
        assert!(recent.insert(TileCoord::new(0, 0, 5)));
        assert!(!recent.insert(TileCoord::new(0, 0, 5)));

        for x in 1..RECENT_TILES_WINDOW as u32 {
            assert!(recent.insert(TileCoord::new(x, 0, 5)));
        }
        assert_eq!(recent.tiles.len(), RECENT_TILES_WINDOW);
        assert!(!recent.insert(TileCoord::new(0, 0, 5)));

        // one more pushes the oldest entry out
        assert!(recent.insert(TileCoord::new(0, 1, 5)));
        assert_eq!(recent.tiles.len(), RECENT_TILES_WINDOW);
        assert!(recent.insert(TileCoord::new(0, 0, 5)));
    }

    #[test]
    fn test_report_till_level() {
        assert_eq!(WalkerConfig::seed(vec![0, 1, 2]).report_till_level(), Some(2));
        assert_eq!(
            WalkerConfig::seed((0..10).collect()).report_till_level(),
            Some(8)
        );
        assert_eq!(WalkerConfig::seed(vec![5]).report_till_level(), Some(5));
        assert_eq!(WalkerConfig::seed(Vec::new()).report_till_level(), None);
    }
}
