//! Export command - copy tiles into each task's `export_directory`.

use super::common::{require_tasks, RunArgs, Session};
use crate::error::CliError;

pub fn run(args: RunArgs) -> Result<(), CliError> {
    let session = Session::prepare(&args)?;
    let tasks = require_tasks(session.config.export_tasks(&session.cache, &session.tasks)?)?;

    println!("tileseed v{} - export", tileseed::VERSION);
    println!("Origin: {}", session.cache.root().display());
    println!("Tasks:  {}", tasks.len());
    println!();

    let report = tileseed::task::export(tasks, &session.options);
    session.finish(&report)
}
