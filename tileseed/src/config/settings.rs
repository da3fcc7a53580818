//! Settings structs and defaults for every configuration section.
//!
//! Each struct represents one `[section]` of the INI file. These are plain
//! data types; parsing lives in [`super::parser`].

use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};

use crate::cache::{Dimensions, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_TILE_EXTENSION};
use crate::grid::{BBox, GEODETIC_SRS, WEB_MERCATOR_SRS};
use crate::task::{DEFAULT_CONCURRENCY, DEFAULT_LOCK_RETRY_DELAY};
use crate::worker::DEFAULT_MAX_ATTEMPTS;

// =============================================================================
// Defaults
// =============================================================================

/// Number of zoom levels of the grid.
pub const DEFAULT_GRID_LEVELS: u8 = 20;

/// Upper bound for `grid.levels`; tile columns and rows are 32-bit.
pub const MAX_GRID_LEVELS: u8 = 32;

/// Base tiles per meta-tile along each axis.
pub const DEFAULT_META_SIZE: (u32, u32) = (4, 4);

/// Meta-tile buffer in pixels.
pub const DEFAULT_META_BUFFER: u32 = 0;

pub const DEFAULT_CACHE_NAME: &str = "default";

pub const DEFAULT_PROGRESS_FILE_NAME: &str = "progress.json";

pub const DEFAULT_STEP_INTERVAL_MS: u64 = 1000;

/// Directory holding the configuration, progress file and default cache.
pub fn config_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tileseed")
}

/// Default configuration file (`~/.tileseed/config.ini`).
pub fn config_file_path() -> PathBuf {
    config_directory().join("config.ini")
}

// =============================================================================
// Sections
// =============================================================================

/// Complete configuration loaded from an INI file.
#[derive(Debug, Clone, Default)]
pub struct ConfigFile {
    pub grid: GridSettings,
    pub cache: CacheSettings,
    pub seed: SeedSettings,
    /// `[task.<name>]` sections in file order.
    pub tasks: Vec<TaskSettings>,
}

/// Grid preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridKind {
    #[default]
    WebMercator,
    Geodetic,
}

impl GridKind {
    pub fn srs(&self) -> &'static str {
        match self {
            GridKind::WebMercator => WEB_MERCATOR_SRS,
            GridKind::Geodetic => GEODETIC_SRS,
        }
    }
}

impl FromStr for GridKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "web_mercator" | "webmercator" | "epsg:3857" => Ok(GridKind::WebMercator),
            "geodetic" | "epsg:4326" => Ok(GridKind::Geodetic),
            _ => Err(()),
        }
    }
}

/// `[grid]` section.
#[derive(Debug, Clone)]
pub struct GridSettings {
    pub kind: GridKind,
    pub levels: u8,
    pub meta_size: (u32, u32),
    pub meta_buffer: u32,
}

impl Default for GridSettings {
    fn default() -> Self {
        Self {
            kind: GridKind::default(),
            levels: DEFAULT_GRID_LEVELS,
            meta_size: DEFAULT_META_SIZE,
            meta_buffer: DEFAULT_META_BUFFER,
        }
    }
}

/// `[cache]` section.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub name: String,
    pub directory: PathBuf,
    pub extension: String,
    /// URL template of the upstream tile server.
    pub source_url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            name: DEFAULT_CACHE_NAME.to_string(),
            directory: config_directory().join("cache"),
            extension: DEFAULT_TILE_EXTENSION.to_string(),
            source_url: None,
            timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

/// `[seed]` section.
#[derive(Debug, Clone)]
pub struct SeedSettings {
    pub concurrency: usize,
    pub skip_geoms_for_last_levels: usize,
    pub progress_file: PathBuf,
    /// Attempts per work item, including the first.
    pub retry_attempts: u32,
    pub step_interval_ms: u64,
    pub lock_retry_delay_secs: u64,
}

impl Default for SeedSettings {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            skip_geoms_for_last_levels: 0,
            progress_file: config_directory().join(DEFAULT_PROGRESS_FILE_NAME),
            retry_attempts: DEFAULT_MAX_ATTEMPTS,
            step_interval_ms: DEFAULT_STEP_INTERVAL_MS,
            lock_retry_delay_secs: DEFAULT_LOCK_RETRY_DELAY.as_secs(),
        }
    }
}

/// One `[task.<name>]` section.
#[derive(Debug, Clone, Default)]
pub struct TaskSettings {
    pub name: String,
    pub levels: Vec<u8>,
    /// Coverage in grid coordinates. `None` covers the whole grid.
    pub bbox: Option<BBox>,
    pub refresh_before: Option<DateTime<Utc>>,
    pub remove_before: Option<DateTime<Utc>>,
    /// Destination directory for export.
    pub export_directory: Option<PathBuf>,
    /// `dim.<key> = value` entries.
    pub dimensions: Dimensions,
}
