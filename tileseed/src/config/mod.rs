//! INI configuration for the command line front end.
//!
//! ```ini
//! [grid]
//! type = web_mercator        ; or geodetic
//! levels = 20
//! meta_size = 4,4
//! meta_buffer = 0
//!
//! [cache]
//! name = osm
//! directory = ~/.tileseed/cache/osm
//! extension = png
//! source = https://tile.example.org/{z}/{x}/{y}.png
//!
//! [seed]
//! concurrency = 4
//! progress_file = ~/.tileseed/progress.json
//!
//! [task.europe]
//! levels = 0-8
//! bbox = -1113195,4163881,4452780,11068715
//! refresh_before = 7d
//! remove_before = 30d
//! export_directory = /srv/export/europe
//! dim.time = 2024-01-01
//! ```
//!
//! Settings structs live in [`settings`], parsing in [`parser`]. The methods
//! on [`ConfigFile`] turn the settings into caches and tasks.

mod parser;
mod settings;

pub use parser::{
    expand_tilde, parse_bbox, parse_levels, parse_timestamp, DIMENSION_KEY_PREFIX,
    TASK_SECTION_PREFIX,
};
pub use settings::*;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ini::Ini;
use thiserror::Error;

use crate::cache::{
    CacheError, CacheManager, CacheTileSource, DiskCacheManager, HttpTileSource, ReqwestClient,
};
use crate::coverage::{BBoxCoverage, Coverage};
use crate::grid::{GridError, MetaGrid, TileGrid};
use crate::task::{CleanupTask, ExportTask, RunOptions, SeedTask};
use crate::worker::RetryPolicy;

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigFileError {
    /// Failed to read or parse the INI file.
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] ini::Error),

    /// Invalid configuration value.
    #[error("Invalid configuration: {section}.{key} = '{value}' - {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },

    /// A key the operation needs is absent.
    #[error("Missing configuration: {section}.{key}")]
    MissingValue { section: String, key: String },

    /// A requested task has no `[task.<name>]` section.
    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("Invalid grid: {0}")]
    Grid(#[from] GridError),

    #[error("Cache setup failed: {0}")]
    Cache(#[from] CacheError),
}

impl ConfigFile {
    /// Loads configuration from `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_file(path)?;
        parser::parse_ini(&ini, Utc::now())
    }

    /// Parses configuration text.
    pub fn load_from_str(text: &str) -> Result<Self, ConfigFileError> {
        let ini = Ini::load_from_str(text).map_err(ini::Error::Parse)?;
        parser::parse_ini(&ini, Utc::now())
    }

    pub fn build_grid(&self) -> Result<TileGrid, ConfigFileError> {
        let grid = match self.grid.kind {
            GridKind::WebMercator => TileGrid::web_mercator(self.grid.levels)?,
            GridKind::Geodetic => TileGrid::geodetic(self.grid.levels)?,
        };
        Ok(grid)
    }

    /// Builds the configured disk cache with its meta grid and upstream source.
    pub fn build_cache(&self) -> Result<Arc<DiskCacheManager>, ConfigFileError> {
        let grid = self.build_grid()?;
        let meta_grid = MetaGrid::new(grid.clone(), self.grid.meta_size, self.grid.meta_buffer)?;
        let mut cache = DiskCacheManager::new(&self.cache.name, &self.cache.directory, grid)
            .with_meta_grid(meta_grid)
            .with_extension(&self.cache.extension);
        if let Some(url) = &self.cache.source_url {
            let client = ReqwestClient::with_timeout(self.cache.timeout_secs)?;
            cache = cache.with_source(Arc::new(HttpTileSource::new(url.clone(), client)));
        }
        Ok(Arc::new(cache))
    }

    /// Run settings from the `[seed]` section.
    pub fn run_options(&self) -> RunOptions {
        RunOptions::default()
            .with_concurrency(self.seed.concurrency)
            .with_skip_geoms_for_last_levels(self.seed.skip_geoms_for_last_levels)
            .with_retry_policy(RetryPolicy::exponential(self.seed.retry_attempts))
            .with_lock_retry_delay(Duration::from_secs(self.seed.lock_retry_delay_secs))
    }

    pub fn seed_tasks(
        &self,
        cache: &Arc<DiskCacheManager>,
        names: &[String],
    ) -> Result<Vec<SeedTask>, ConfigFileError> {
        self.select_tasks(names)?
            .into_iter()
            .map(|settings| {
                let manager: Arc<dyn CacheManager> = cache.clone();
                let task = SeedTask::new(
                    format!("seed:{}", settings.name),
                    manager,
                    settings.levels.clone(),
                    Some(coverage_for(settings, cache.grid())),
                )
                .with_refresh_before(settings.refresh_before);
                Ok(with_dimensions(task, settings, SeedTask::with_dimensions))
            })
            .collect()
    }

    /// Cleanup tasks; every selected task needs `remove_before`.
    pub fn cleanup_tasks(
        &self,
        cache: &Arc<DiskCacheManager>,
        names: &[String],
    ) -> Result<Vec<CleanupTask>, ConfigFileError> {
        self.select_tasks(names)?
            .into_iter()
            .map(|settings| {
                let remove_before =
                    settings
                        .remove_before
                        .ok_or_else(|| ConfigFileError::MissingValue {
                            section: format!("{}{}", TASK_SECTION_PREFIX, settings.name),
                            key: "remove_before".to_string(),
                        })?;
                let grid = cache.grid();
                let complete = settings
                    .bbox
                    .map_or(true, |bbox| bbox.contains(grid.bbox()));
                let manager: Arc<dyn CacheManager> = cache.clone();
                Ok(CleanupTask::new(
                    format!("cleanup:{}", settings.name),
                    manager,
                    settings.levels.clone(),
                    Some(coverage_for(settings, grid)),
                    remove_before,
                )
                .with_complete_extent(complete))
            })
            .collect()
    }

    /// Export tasks; every selected task needs `export_directory`.
    ///
    /// Each destination is a disk cache that fills itself from `cache`.
    pub fn export_tasks(
        &self,
        cache: &Arc<DiskCacheManager>,
        names: &[String],
    ) -> Result<Vec<ExportTask>, ConfigFileError> {
        self.select_tasks(names)?
            .into_iter()
            .map(|settings| {
                let directory =
                    settings
                        .export_directory
                        .as_ref()
                        .ok_or_else(|| ConfigFileError::MissingValue {
                            section: format!("{}{}", TASK_SECTION_PREFIX, settings.name),
                            key: "export_directory".to_string(),
                        })?;
                let destination: Arc<dyn CacheManager> = Arc::new(
                    DiskCacheManager::new(
                        format!("{}-export-{}", cache.name(), settings.name),
                        directory,
                        cache.grid().clone(),
                    )
                    .with_extension(&self.cache.extension)
                    .with_source(Arc::new(CacheTileSource::new(Arc::clone(cache)))),
                );
                let task = ExportTask::new(
                    format!("export:{}", settings.name),
                    destination,
                    settings.levels.clone(),
                    Some(coverage_for(settings, cache.grid())),
                );
                Ok(with_dimensions(task, settings, ExportTask::with_dimensions))
            })
            .collect()
    }

    /// Tasks named in `names`, or all tasks in file order when empty.
    fn select_tasks(&self, names: &[String]) -> Result<Vec<&TaskSettings>, ConfigFileError> {
        if names.is_empty() {
            return Ok(self.tasks.iter().collect());
        }
        names
            .iter()
            .map(|name| {
                self.tasks
                    .iter()
                    .find(|t| &t.name == name)
                    .ok_or_else(|| ConfigFileError::UnknownTask(name.clone()))
            })
            .collect()
    }
}

fn coverage_for(settings: &TaskSettings, grid: &TileGrid) -> Arc<dyn Coverage> {
    let bbox = settings.bbox.unwrap_or(*grid.bbox());
    Arc::new(BBoxCoverage::new(bbox, grid.srs()))
}

fn with_dimensions<T>(
    task: T,
    settings: &TaskSettings,
    apply: impl FnOnce(T, crate::cache::Dimensions) -> T,
) -> T {
    if settings.dimensions.is_empty() {
        task
    } else {
        apply(task, settings.dimensions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> ConfigFile {
        ConfigFile::load_from_str(&format!(
            r#"
[grid]
levels = 6

[cache]
name = osm
directory = {}

[task.world]
levels = 0-2
remove_before = 1d

[task.corner]
levels = 3
bbox = 0,0,1000000,1000000
export_directory = {}
"#,
            dir.path().join("cache").display(),
            dir.path().join("export").display(),
        ))
        .unwrap()
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let result = ConfigFile::load_from(&dir.path().join("missing.ini"));
        assert!(matches!(result, Err(ConfigFileError::ReadError(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "[seed]\nconcurrency = 3\n").unwrap();
        let config = ConfigFile::load_from(&path).unwrap();
        assert_eq!(config.seed.concurrency, 3);
        assert_eq!(config.run_options().concurrency, 3);
    }

    #[test]
    fn test_build_cache_uses_settings() {
        let dir = TempDir::new().unwrap();
        let cache = config(&dir).build_cache().unwrap();
        assert_eq!(cache.name(), "osm");
        assert_eq!(cache.grid().max_level(), 5);
        assert_eq!(cache.root(), dir.path().join("cache"));
        assert!(cache.meta_grid().is_some());
    }

    #[test]
    fn test_seed_tasks_all_and_selected() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let cache = config.build_cache().unwrap();

        let all = config.seed_tasks(&cache, &[]).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id(), "seed:world");
        assert_eq!(all[0].levels(), &[0, 1, 2]);
        assert!(all.iter().all(|t| t.validate().is_ok()));

        let one = config.seed_tasks(&cache, &["corner".to_string()]).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].levels(), &[3]);

        let unknown = config.seed_tasks(&cache, &["nope".to_string()]);
        assert!(matches!(unknown, Err(ConfigFileError::UnknownTask(name)) if name == "nope"));
    }

    #[test]
    fn test_cleanup_tasks_need_remove_before() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let cache = config.build_cache().unwrap();

        let tasks = config.cleanup_tasks(&cache, &["world".to_string()]).unwrap();
        assert!(tasks[0].complete_extent());

        let err = config.cleanup_tasks(&cache, &["corner".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            ConfigFileError::MissingValue { key, .. } if key == "remove_before"
        ));
    }

    #[test]
    fn test_export_tasks_need_directory() {
        let dir = TempDir::new().unwrap();
        let config = config(&dir);
        let cache = config.build_cache().unwrap();

        let tasks = config.export_tasks(&cache, &["corner".to_string()]).unwrap();
        assert_eq!(tasks[0].manager().name(), "osm-export-corner");

        let err = config.export_tasks(&cache, &["world".to_string()]).unwrap_err();
        assert!(matches!(
            err,
            ConfigFileError::MissingValue { key, .. } if key == "export_directory"
        ));
    }
}
