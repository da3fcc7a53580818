//! tileseed CLI - seed, clean up and export map tile caches
//!
//! Tasks, cache and grid come from an INI configuration file
//! (`~/.tileseed/config.ini` unless `--config` is given).

mod commands;
mod error;
mod progress;

use clap::{Parser, Subcommand};
use tileseed::logging::{default_log_dir, default_log_file, init_logging};

use commands::common::RunArgs;
use error::CliError;

#[derive(Parser)]
#[command(name = "tileseed")]
#[command(version, about = "Seed and clean up map tile caches", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load every tile of the configured tasks into the cache
    Seed(RunArgs),
    /// Remove tiles older than each task's remove_before
    Cleanup(RunArgs),
    /// Copy tiles into each task's export_directory
    Export(RunArgs),
}

fn main() {
    let cli = Cli::parse();

    let _guard = match init_logging(&default_log_dir(), default_log_file()) {
        Ok(guard) => guard,
        Err(e) => CliError::LoggingInit(e).exit(),
    };

    let result = match cli.command {
        Commands::Seed(args) => commands::seed::run(args),
        Commands::Cleanup(args) => commands::cleanup::run(args),
        Commands::Export(args) => commands::export::run(args),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "Command failed");
        e.exit();
    }
}
