//! Seed command - load tiles into the cache.

use super::common::{require_tasks, RunArgs, Session};
use crate::error::CliError;

pub fn run(args: RunArgs) -> Result<(), CliError> {
    let session = Session::prepare(&args)?;
    let tasks = require_tasks(session.config.seed_tasks(&session.cache, &session.tasks)?)?;

    println!("tileseed v{} - seeding", tileseed::VERSION);
    println!("Cache: {}", session.cache.root().display());
    println!("Tasks: {}", tasks.len());
    println!();

    let report = tileseed::task::seed(tasks, &session.options);
    session.finish(&report)
}
