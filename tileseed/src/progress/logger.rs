//! Progress reporting hooks called by the walker and the worker pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use super::{format_duration, ProgressStore, SeedProgress};
use crate::grid::BBox;

/// Minimum time between two step log lines.
pub const DEFAULT_STEP_INTERVAL: Duration = Duration::from_secs(1);

/// Receiver of traversal progress.
///
/// `log_progress` is called by the walker when it enters a reportable level,
/// `log_step` by the pool for every dispatched work item. Both run on the
/// walking thread.
pub trait ProgressLogger: Send + Sync {
    fn log_progress(&self, progress: &SeedProgress, level: u8, bbox: &BBox, tiles: u64);

    fn log_step(&self, progress: &SeedProgress);

    /// Task the following calls belong to.
    fn set_current_task_id(&self, task_id: &str);
}

/// Stores and saves the position a resumed run of `task_id` may start from.
///
/// Loggers call this on level transitions. The identifier already accounts
/// for work still in flight, so a crash right after the save skips nothing
/// unwritten.
pub fn save_progress(store: &dyn ProgressStore, task_id: &str, progress: &SeedProgress) {
    store.store(task_id, progress.current_progress_identifier());
    if let Err(e) = store.save() {
        warn!(task_id, error = %e, "Failed to save progress");
    }
}

/// [`ProgressLogger`] writing through `tracing`.
///
/// With a store attached, every `log_progress` call also records the current
/// identifier for the running task, so a crash loses at most one level
/// transition worth of work.
pub struct LogProgressLogger {
    store: Option<Arc<dyn ProgressStore>>,
    step_interval: Duration,
    last_step: Mutex<Option<Instant>>,
    task_id: Mutex<Option<String>>,
}

impl LogProgressLogger {
    pub fn new() -> Self {
        Self {
            store: None,
            step_interval: DEFAULT_STEP_INTERVAL,
            last_step: Mutex::new(None),
            task_id: Mutex::new(None),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_step_interval(mut self, interval: Duration) -> Self {
        self.step_interval = interval;
        self
    }

    fn task_id(&self) -> String {
        self.task_id.lock().clone().unwrap_or_default()
    }

    /// True if enough time has passed since the last step line.
    fn step_due(&self) -> bool {
        let mut last = self.last_step.lock();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.step_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl Default for LogProgressLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressLogger for LogProgressLogger {
    fn log_progress(&self, progress: &SeedProgress, level: u8, bbox: &BBox, tiles: u64) {
        let snapshot = progress.snapshot();
        let task_id = self.task_id();
        info!(
            task_id = %task_id,
            level,
            bbox = %bbox,
            tiles,
            progress = %format!("{:.2}%", snapshot.fraction * 100.0),
            eta = %snapshot.eta.map(format_duration).unwrap_or_default(),
            path = %snapshot.path,
            "Seeding level"
        );

        if let Some(store) = &self.store {
            save_progress(store.as_ref(), &task_id, progress);
        }
    }

    fn log_step(&self, progress: &SeedProgress) {
        if !self.step_due() {
            return;
        }
        let snapshot = progress.snapshot();
        info!(
            task_id = %self.task_id(),
            progress = %format!("{:.2}%", snapshot.fraction * 100.0),
            eta = %snapshot.eta.map(format_duration).unwrap_or_default(),
            path = %snapshot.path,
            skipping = snapshot.already_processed,
            "Seed step"
        );
    }

    fn set_current_task_id(&self, task_id: &str) {
        *self.task_id.lock() = Some(task_id.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{JsonProgressStore, ProgressIdentifier};
    use tempfile::TempDir;

    #[test]
    fn test_step_throttling() {
        let logger = LogProgressLogger::new().with_step_interval(Duration::from_secs(3600));
        assert!(logger.step_due());
        assert!(!logger.step_due());

        let eager = LogProgressLogger::new().with_step_interval(Duration::ZERO);
        assert!(eager.step_due());
        assert!(eager.step_due());
    }

    #[test]
    fn test_log_progress_writes_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let store: Arc<dyn ProgressStore> = Arc::new(JsonProgressStore::open(&path).unwrap());
        let logger = LogProgressLogger::new().with_store(store.clone());
        logger.set_current_task_id("roads");

        let mut progress = SeedProgress::new(None);
        progress.step_down(1, 4);
        let bbox = BBox::new(0.0, 0.0, 1.0, 1.0).unwrap();
        logger.log_progress(&progress, 1, &bbox, 4);

        assert_eq!(
            store.get("roads"),
            Some(ProgressIdentifier::from(vec![(1, 4)]))
        );
        assert!(path.exists());
    }

    #[test]
    fn test_save_progress_uses_oldest_in_flight_position() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("progress.json");
        let store = JsonProgressStore::open(&path).unwrap();

        let mut progress = SeedProgress::new(None);
        progress.step_down(3, 4);
        progress.set_in_flight(Some(ProgressIdentifier::from(vec![(1, 4), (2, 4)])));
        save_progress(&store, "roads", &progress);

        let reloaded = JsonProgressStore::open(&path).unwrap();
        assert_eq!(
            reloaded.get("roads"),
            Some(ProgressIdentifier::from(vec![(1, 4), (2, 4)]))
        );
    }
}
