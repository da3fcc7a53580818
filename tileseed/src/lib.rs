//! tileseed - Pre-generate and purge map tile caches
//!
//! This library walks a tile pyramid for a geographic coverage and a set of
//! zoom levels, and hands batches of tiles to a pool of worker threads that
//! load them into (or remove them from) a cache.
//!
//! # High-Level API
//!
//! ```ignore
//! use std::sync::Arc;
//! use tileseed::cache::DiskCacheManager;
//! use tileseed::coverage::{BBoxCoverage, Coverage};
//! use tileseed::grid::TileGrid;
//! use tileseed::task::{seed, RunOptions, SeedTask};
//!
//! let grid = TileGrid::web_mercator(20)?;
//! let cache = Arc::new(DiskCacheManager::new("osm", "/srv/tiles/osm", grid.clone()));
//! let coverage: Arc<dyn Coverage> = Arc::new(BBoxCoverage::new(*grid.bbox(), grid.srs()));
//!
//! let task = SeedTask::new("world", cache, vec![0, 1, 2, 3], Some(coverage));
//! let report = seed(vec![task], &RunOptions::default());
//! ```
//!
//! A run can be cancelled through the [`tokio_util::sync::CancellationToken`]
//! in [`task::RunOptions`]; with a [`progress::ProgressStore`] configured the
//! next run resumes where the cancelled one stopped.

pub mod cache;
pub mod config;
pub mod coverage;
pub mod grid;
pub mod logging;
pub mod progress;
pub mod task;
pub mod walker;
pub mod worker;

pub use cache::{CacheError, CacheManager, DiskCacheManager};
pub use grid::{BBox, TileCoord, TileGrid};
pub use task::{cleanup, export, seed, CleanupTask, ExportTask, RunOptions, RunReport, SeedTask};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
