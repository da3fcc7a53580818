//! File-per-tile cache on the local filesystem.
//!
//! ```text
//! <root>/
//! └── <z>/
//!     └── <x>/
//!         └── <y>.<ext>
//! ```
//!
//! Tile age is the file modification time. Writes go through a temporary file
//! in the same directory followed by a rename, so readers never observe a
//! partially written tile.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, trace};

use super::{CacheError, CacheManager, Dimensions, TileSource};
use crate::grid::{MetaGrid, TileCoord, TileGrid};

/// Extension used when none is configured.
pub const DEFAULT_TILE_EXTENSION: &str = "png";

/// Disk-backed [`CacheManager`].
pub struct DiskCacheManager {
    name: String,
    root: PathBuf,
    extension: String,
    grid: TileGrid,
    meta_grid: Option<MetaGrid>,
    source: Option<Arc<dyn TileSource>>,
    expire: RwLock<Option<DateTime<Utc>>>,
    minimize_meta_requests: AtomicBool,
}

impl DiskCacheManager {
    /// Creates a cache without meta-tiles and without an upstream source.
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, grid: TileGrid) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            extension: DEFAULT_TILE_EXTENSION.to_string(),
            grid,
            meta_grid: None,
            source: None,
            expire: RwLock::new(None),
            minimize_meta_requests: AtomicBool::new(false),
        }
    }

    /// Groups requests into meta-tiles.
    pub fn with_meta_grid(mut self, meta_grid: MetaGrid) -> Self {
        self.meta_grid = Some(meta_grid);
        self
    }

    /// Fetches missing tiles from `source`.
    pub fn with_source(mut self, source: Arc<dyn TileSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether redundant meta-tile requests are currently avoided.
    pub fn minimize_meta_requests(&self) -> bool {
        self.minimize_meta_requests.load(Ordering::Relaxed)
    }

    /// Path of a tile file.
    pub fn tile_path(&self, coord: &TileCoord) -> PathBuf {
        self.root
            .join(coord.z.to_string())
            .join(coord.x.to_string())
            .join(format!("{}.{}", coord.y, self.extension))
    }

    /// Reads a stored tile.
    pub fn read_tile(&self, coord: &TileCoord) -> Result<Vec<u8>, CacheError> {
        let path = self.tile_path(coord);
        fs::read(&path).map_err(|e| CacheError::io(path, e))
    }

    /// Stores a tile atomically.
    pub fn write_tile(&self, coord: &TileCoord, data: &[u8]) -> Result<(), CacheError> {
        let path = self.tile_path(coord);
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let tmp = dir.join(format!(".{}.{}.tmp", coord.y, std::process::id()));
        fs::write(&tmp, data).map_err(|e| CacheError::io(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(CacheError::io(path, e));
        }
        Ok(())
    }

    /// Whether `path` names a stored tile: `{y}.{extension}`, not a
    /// hidden temporary file and not a file of another format.
    fn is_tile_file(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        match name.rsplit_once('.') {
            Some((stem, ext)) => ext == self.extension && stem.parse::<u64>().is_ok(),
            None => false,
        }
    }

    fn modified(&self, coord: &TileCoord) -> Option<DateTime<Utc>> {
        let meta = fs::metadata(self.tile_path(coord)).ok()?;
        meta.modified().ok().map(DateTime::<Utc>::from)
    }

    fn is_fresh(&self, coord: &TileCoord) -> bool {
        match self.modified(coord) {
            Some(mtime) => match *self.expire.read() {
                Some(expire) => mtime >= expire,
                None => true,
            },
            None => false,
        }
    }

    fn fetch_and_store(
        &self,
        coord: &TileCoord,
        dimensions: Option<&Dimensions>,
    ) -> Result<(), CacheError> {
        let source = self.source.as_ref().ok_or(CacheError::NoSource(*coord))?;
        let data = source.fetch(coord, dimensions)?;
        self.write_tile(coord, &data)?;
        trace!(cache = %self.name, tile = %coord, bytes = data.len(), "Tile stored");
        Ok(())
    }
}

impl CacheManager for DiskCacheManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn grid(&self) -> &TileGrid {
        &self.grid
    }

    fn meta_grid(&self) -> Option<&MetaGrid> {
        self.meta_grid.as_ref()
    }

    fn load_tile_coords(
        &self,
        coords: &[TileCoord],
        dimensions: Option<&Dimensions>,
        load_all: bool,
    ) -> Result<usize, CacheError> {
        let missing: Vec<&TileCoord> = coords.iter().filter(|c| !self.is_fresh(c)).collect();
        if missing.is_empty() {
            return Ok(0);
        }

        // a partial miss refreshes the whole batch unless asked to minimize
        let targets: Vec<&TileCoord> = if load_all && !self.minimize_meta_requests() {
            coords.iter().collect()
        } else {
            missing
        };

        for coord in &targets {
            if !self.grid.is_valid(coord) {
                return Err(CacheError::Grid(crate::grid::GridError::TileOutOfRange(
                    **coord,
                )));
            }
            self.fetch_and_store(coord, dimensions)?;
        }
        debug!(cache = %self.name, tiles = targets.len(), "Loaded tiles");
        Ok(targets.len())
    }

    fn remove_tile_coords(&self, coords: &[TileCoord]) -> Result<usize, CacheError> {
        let mut removed = 0;
        for coord in coords {
            let path = self.tile_path(coord);
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }
        Ok(removed)
    }

    fn supports_level_removal(&self) -> bool {
        true
    }

    fn remove_level_tiles_before(
        &self,
        level: u8,
        timestamp: DateTime<Utc>,
    ) -> Result<usize, CacheError> {
        let level_dir = self.root.join(level.to_string());
        if !level_dir.is_dir() {
            return Ok(0);
        }

        let mut removed = 0;
        let columns = fs::read_dir(&level_dir).map_err(|e| CacheError::io(&level_dir, e))?;
        for column in columns {
            let column = column.map_err(|e| CacheError::io(&level_dir, e))?;
            let column_path = column.path();
            if !column_path.is_dir() {
                continue;
            }
            let entries =
                fs::read_dir(&column_path).map_err(|e| CacheError::io(&column_path, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| CacheError::io(&column_path, e))?;
                let path = entry.path();
                if !self.is_tile_file(&path) {
                    continue;
                }
                let meta = entry.metadata().map_err(|e| CacheError::io(&path, e))?;
                if !meta.is_file() {
                    continue;
                }
                let mtime = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .map_err(|e| CacheError::io(&path, e))?;
                if mtime < timestamp {
                    fs::remove_file(&path).map_err(|e| CacheError::io(&path, e))?;
                    removed += 1;
                }
            }
            // drop the column directory once it is empty
            let _ = fs::remove_dir(&column_path);
        }

        debug!(cache = %self.name, level, removed, before = %timestamp, "Removed level tiles");
        Ok(removed)
    }

    fn is_cached(&self, coord: &TileCoord, _dimensions: Option<&Dimensions>) -> bool {
        self.is_fresh(coord)
    }

    fn is_stale(&self, coord: &TileCoord) -> bool {
        match (self.modified(coord), *self.expire.read()) {
            (Some(mtime), Some(expire)) => mtime < expire,
            _ => false,
        }
    }

    fn set_expire_timestamp(&self, timestamp: Option<DateTime<Utc>>) {
        *self.expire.write() = timestamp;
    }

    fn set_minimize_meta_requests(&self, minimize: bool) {
        self.minimize_meta_requests.store(minimize, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use filetime::FileTime;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    struct CountingSource {
        fetched: Mutex<Vec<TileCoord>>,
    }

    impl CountingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fetched: Mutex::new(Vec::new()),
            })
        }
    }

    impl TileSource for CountingSource {
        fn name(&self) -> &str {
            "counting"
        }

        fn fetch(
            &self,
            coord: &TileCoord,
            _dimensions: Option<&Dimensions>,
        ) -> Result<Vec<u8>, CacheError> {
            self.fetched.lock().push(*coord);
            Ok(coord.to_string().into_bytes())
        }
    }

    fn cache_with_source(dir: &TempDir) -> (DiskCacheManager, Arc<CountingSource>) {
        let source = CountingSource::new();
        let cache = DiskCacheManager::new("test", dir.path(), TileGrid::web_mercator(6).unwrap())
            .with_source(source.clone());
        (cache, source)
    }

    fn set_age(path: &Path, unix_secs: i64) {
        filetime::set_file_mtime(path, FileTime::from_unix_time(unix_secs, 0)).unwrap();
    }

    #[test]
    fn test_tile_path_layout() {
        let cache = DiskCacheManager::new("c", "/tmp/tiles", TileGrid::web_mercator(3).unwrap())
            .with_extension(".jpeg");
        assert_eq!(
            cache.tile_path(&TileCoord::new(1, 2, 3)),
            PathBuf::from("/tmp/tiles/3/1/2.jpeg")
        );
    }

    #[test]
    fn test_load_fetches_only_missing_tiles() {
        let dir = TempDir::new().unwrap();
        let (cache, source) = cache_with_source(&dir);
        let a = TileCoord::new(0, 0, 1);
        let b = TileCoord::new(1, 0, 1);
        cache.write_tile(&a, b"existing").unwrap();

        let loaded = cache.load_tile_coords(&[a, b], None, false).unwrap();
        assert_eq!(loaded, 1);
        assert_eq!(source.fetched.lock().as_slice(), [b]);
        assert_eq!(cache.read_tile(&a).unwrap(), b"existing");
        assert_eq!(cache.read_tile(&b).unwrap(), b"1/1/0");
    }

    #[test]
    fn test_load_all_refreshes_whole_batch() {
        let dir = TempDir::new().unwrap();
        let (cache, source) = cache_with_source(&dir);
        let a = TileCoord::new(0, 0, 1);
        let b = TileCoord::new(1, 0, 1);
        cache.write_tile(&a, b"existing").unwrap();

        assert_eq!(cache.load_tile_coords(&[a, b], None, true).unwrap(), 2);
        assert_eq!(source.fetched.lock().len(), 2);

        // nothing missing: no fetch at all
        assert_eq!(cache.load_tile_coords(&[a, b], None, true).unwrap(), 0);
        assert_eq!(source.fetched.lock().len(), 2);
    }

    #[test]
    fn test_minimize_meta_requests_limits_load_all() {
        let dir = TempDir::new().unwrap();
        let (cache, source) = cache_with_source(&dir);
        let a = TileCoord::new(0, 0, 1);
        let b = TileCoord::new(1, 0, 1);
        cache.write_tile(&a, b"existing").unwrap();
        cache.set_minimize_meta_requests(true);

        assert_eq!(cache.load_tile_coords(&[a, b], None, true).unwrap(), 1);
        assert_eq!(source.fetched.lock().as_slice(), [b]);
    }

    #[test]
    fn test_missing_source_is_an_error() {
        let dir = TempDir::new().unwrap();
        let cache = DiskCacheManager::new("c", dir.path(), TileGrid::web_mercator(3).unwrap());
        let coord = TileCoord::new(0, 0, 0);
        let err = cache.load_tile_coords(&[coord], None, false).unwrap_err();
        assert!(matches!(err, CacheError::NoSource(c) if c == coord));
    }

    #[test]
    fn test_expire_timestamp_controls_cached_and_stale() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_source(&dir);
        let coord = TileCoord::new(2, 2, 2);
        cache.write_tile(&coord, b"x").unwrap();
        set_age(&cache.tile_path(&coord), 1_000_000);

        assert!(cache.is_cached(&coord, None));
        assert!(!cache.is_stale(&coord));

        cache.set_expire_timestamp(Some(Utc.timestamp_opt(2_000_000, 0).unwrap()));
        assert!(!cache.is_cached(&coord, None));
        assert!(cache.is_stale(&coord));

        let missing = TileCoord::new(0, 0, 2);
        assert!(!cache.is_stale(&missing));
        assert!(!cache.is_cached(&missing, None));
    }

    #[test]
    fn test_remove_tile_coords_ignores_missing() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_source(&dir);
        let a = TileCoord::new(0, 0, 1);
        cache.write_tile(&a, b"x").unwrap();

        let removed = cache
            .remove_tile_coords(&[a, TileCoord::new(1, 1, 1)])
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!cache.tile_path(&a).exists());
    }

    #[test]
    fn test_remove_level_tiles_before() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_source(&dir);
        let old = TileCoord::new(0, 0, 3);
        let new = TileCoord::new(1, 0, 3);
        let other_level = TileCoord::new(0, 0, 2);
        for c in [old, new, other_level] {
            cache.write_tile(&c, b"x").unwrap();
            set_age(&cache.tile_path(&c), 1_000_000);
        }
        set_age(&cache.tile_path(&new), 3_000_000);

        let removed = cache
            .remove_level_tiles_before(3, Utc.timestamp_opt(2_000_000, 0).unwrap())
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!cache.tile_path(&old).exists());
        assert!(cache.tile_path(&new).exists());
        assert!(cache.tile_path(&other_level).exists());

        // absent level is not an error
        assert_eq!(
            cache
                .remove_level_tiles_before(5, Utc.timestamp_opt(2_000_000, 0).unwrap())
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_remove_level_tiles_before_keeps_foreign_files() {
        let dir = TempDir::new().unwrap();
        let (cache, _) = cache_with_source(&dir);
        let tile = TileCoord::new(0, 0, 3);
        cache.write_tile(&tile, b"x").unwrap();
        let column = cache.tile_path(&tile).parent().unwrap().to_path_buf();
        let in_flight = column.join(".1.4242.tmp");
        let other_format = column.join("1.jpeg");
        let notes = column.join("README.txt");
        for path in [&in_flight, &other_format, &notes] {
            fs::write(path, b"keep").unwrap();
        }
        for path in [&cache.tile_path(&tile), &in_flight, &other_format, &notes] {
            set_age(path, 1_000_000);
        }

        let removed = cache
            .remove_level_tiles_before(3, Utc.timestamp_opt(2_000_000, 0).unwrap())
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!cache.tile_path(&tile).exists());
        assert!(in_flight.exists());
        assert!(other_format.exists());
        assert!(notes.exists());
    }
}
