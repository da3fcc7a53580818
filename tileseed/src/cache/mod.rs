//! Cache manager boundary.
//!
//! The seeding engine never touches tile storage directly. Every load,
//! removal and staleness check goes through a [`CacheManager`], which must
//! tolerate concurrent calls from all pool workers.
//!
//! A file-per-tile implementation ([`DiskCacheManager`]) and two upstream
//! sources ([`HttpTileSource`], [`CacheTileSource`]) are provided for the CLI;
//! other backends implement the trait themselves.

mod disk;
mod source;

pub use disk::{DiskCacheManager, DEFAULT_TILE_EXTENSION};
pub use source::{
    CacheTileSource, HttpClient, HttpTileSource, ReqwestClient, TileSource,
    DEFAULT_HTTP_TIMEOUT_SECS,
};

#[cfg(test)]
pub use source::tests::MockHttpClient;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

use crate::grid::{GridError, MetaGrid, TileCoord, TileGrid};

/// Extra request dimensions (time, elevation, ...) forwarded to sources.
pub type Dimensions = BTreeMap<String, String>;

/// Errors reported by cache managers and tile sources.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Filesystem failure on a specific path.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Upstream fetch failed.
    #[error("source error: {0}")]
    Source(String),

    /// A tile is missing and the manager has no source to fetch it from.
    #[error("tile {0} not cached and no source configured")]
    NoSource(TileCoord),

    /// The manager does not implement an optional operation.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// Coordinate or level does not fit the grid.
    #[error(transparent)]
    Grid(#[from] GridError),
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Storage operations the seeder consumes.
///
/// Implementations use interior mutability for the expiry and meta-request
/// settings; the engine only holds shared references.
pub trait CacheManager: Send + Sync {
    /// Name used for locking and logging.
    fn name(&self) -> &str;

    /// Tile grid of the cache.
    fn grid(&self) -> &TileGrid;

    /// Meta-tile grouping, `None` if tiles are requested individually.
    fn meta_grid(&self) -> Option<&MetaGrid>;

    /// Ensures the tiles are present, fetching upstream on miss.
    ///
    /// With `load_all` the whole batch is refreshed as soon as one tile is
    /// missing. Returns the number of tiles written.
    fn load_tile_coords(
        &self,
        coords: &[TileCoord],
        dimensions: Option<&Dimensions>,
        load_all: bool,
    ) -> Result<usize, CacheError>;

    /// Removes the tiles. Missing tiles are not an error. Returns the number
    /// of tiles removed.
    fn remove_tile_coords(&self, coords: &[TileCoord]) -> Result<usize, CacheError>;

    /// True if [`CacheManager::remove_level_tiles_before`] is implemented.
    fn supports_level_removal(&self) -> bool {
        false
    }

    /// Removes every tile of `level` older than `timestamp`.
    fn remove_level_tiles_before(
        &self,
        _level: u8,
        _timestamp: DateTime<Utc>,
    ) -> Result<usize, CacheError> {
        Err(CacheError::Unsupported("remove_level_tiles_before"))
    }

    /// True if the tile is stored and not older than the expiry timestamp.
    fn is_cached(&self, coord: &TileCoord, dimensions: Option<&Dimensions>) -> bool;

    /// True if the tile is stored and older than the expiry timestamp.
    fn is_stale(&self, coord: &TileCoord) -> bool;

    /// Best-effort housekeeping hook, called periodically during walks.
    fn cleanup(&self) -> Result<(), CacheError> {
        Ok(())
    }

    /// Tiles older than this are treated as stale. `None` disables expiry.
    fn set_expire_timestamp(&self, timestamp: Option<DateTime<Utc>>);

    /// Asks the manager to avoid redundant meta-tile requests.
    fn set_minimize_meta_requests(&self, minimize: bool);

    /// True if stored tiles are rescaled from other levels, which requires
    /// processing individual tiles instead of whole meta-tiles.
    fn rescales_tiles(&self) -> bool {
        false
    }
}
