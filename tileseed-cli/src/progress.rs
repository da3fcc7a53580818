//! Terminal progress bar fed by the walker.

use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tileseed::grid::BBox;
use tileseed::progress::{
    format_duration, save_progress, ProgressLogger, ProgressStore, SeedProgress,
};

/// Bar resolution; the walker reports a fraction.
const BAR_LENGTH: u64 = 10_000;

const BAR_TEMPLATE: &str =
    "{prefix:.bold} [{elapsed_precise}] {bar:40.cyan/blue} {percent:>3}% {msg}";

/// [`ProgressLogger`] drawing one bar per task.
///
/// With a store attached, the resume position is saved on every level
/// transition, the bar prefix being the task id.
pub struct BarProgressLogger {
    bar: ProgressBar,
    store: Option<Arc<dyn ProgressStore>>,
}

impl BarProgressLogger {
    pub fn new() -> Self {
        let bar = ProgressBar::new(BAR_LENGTH);
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=>-");
        bar.set_style(style);
        Self { bar, store: None }
    }

    pub fn with_store(mut self, store: Arc<dyn ProgressStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Removes the bar from the terminal.
    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn update(&self, progress: &SeedProgress) {
        let fraction = progress.fraction();
        self.bar.set_position((fraction * BAR_LENGTH as f64) as u64);
        let eta = progress
            .eta()
            .remaining(fraction)
            .map(format_duration)
            .unwrap_or_else(|| "--".to_string());
        self.bar
            .set_message(format!("eta {} {}", eta, progress.progress_string()));
    }
}

impl Default for BarProgressLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressLogger for BarProgressLogger {
    fn log_progress(&self, progress: &SeedProgress, level: u8, bbox: &BBox, tiles: u64) {
        self.bar
            .println(format!("  level {:>2}: {:>8} tiles in {}", level, tiles, bbox));
        self.update(progress);
        if let Some(store) = &self.store {
            save_progress(store.as_ref(), &self.bar.prefix(), progress);
        }
    }

    fn log_step(&self, progress: &SeedProgress) {
        self.update(progress);
    }

    fn set_current_task_id(&self, task_id: &str) {
        self.bar.reset();
        self.bar.set_prefix(task_id.to_string());
        self.bar.println(format!("Task {}", task_id));
    }
}
