//! Cleanup command - remove tiles older than each task's `remove_before`.

use super::common::{require_tasks, RunArgs, Session};
use crate::error::CliError;

pub fn run(args: RunArgs) -> Result<(), CliError> {
    let session = Session::prepare(&args)?;
    let tasks = require_tasks(session.config.cleanup_tasks(&session.cache, &session.tasks)?)?;

    println!("tileseed v{} - cleanup", tileseed::VERSION);
    println!("Cache: {}", session.cache.root().display());
    for task in &tasks {
        println!(
            "  {}: remove before {}{}",
            tileseed::task::Task::id(task),
            task.remove_before().to_rfc3339(),
            if task.complete_extent() { " (whole levels)" } else { "" }
        );
    }
    println!();

    let report = tileseed::task::cleanup(tasks, &session.options);
    session.finish(&report)
}
