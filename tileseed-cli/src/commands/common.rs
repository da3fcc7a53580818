//! Arguments and setup shared by the seed, cleanup and export commands.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use tileseed::cache::DiskCacheManager;
use tileseed::config::{config_file_path, ConfigFile};
use tileseed::progress::{JsonProgressStore, LogProgressLogger, ProgressLogger, ProgressStore};
use tileseed::task::{LocalCacheLocker, RunOptions, RunReport};
use tracing::info;

use crate::error::CliError;
use crate::progress::BarProgressLogger;

/// Options accepted by every run command.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Configuration file [default: ~/.tileseed/config.ini]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Run only this task (repeatable); all tasks when omitted
    #[arg(short = 't', long = "task", value_name = "NAME")]
    pub tasks: Vec<String>,

    /// Worker threads per task
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Progress file [default: from the configuration]
    #[arg(long)]
    pub progress_file: Option<PathBuf>,

    /// Resume from the progress file of an interrupted run
    #[arg(long = "continue")]
    pub resume: bool,

    /// Write log lines instead of drawing a progress bar
    #[arg(long)]
    pub no_progress_bar: bool,
}

/// Everything a command needs to run its tasks.
pub struct Session {
    pub config: ConfigFile,
    pub cache: Arc<DiskCacheManager>,
    pub options: RunOptions,
    pub tasks: Vec<String>,
    progress_file: PathBuf,
    bar: Option<Arc<BarProgressLogger>>,
}

impl Session {
    /// Loads the configuration, opens the progress file and installs the
    /// Ctrl-C handler.
    pub fn prepare(args: &RunArgs) -> Result<Self, CliError> {
        let config_path = args.config.clone().unwrap_or_else(config_file_path);
        let config = ConfigFile::load_from(&config_path)?;
        let cache = config.build_cache()?;

        let progress_file = args
            .progress_file
            .clone()
            .unwrap_or_else(|| config.seed.progress_file.clone());
        let store: Arc<dyn ProgressStore> = if args.resume {
            Arc::new(JsonProgressStore::open(&progress_file)?)
        } else {
            Arc::new(JsonProgressStore::create(&progress_file))
        };

        let mut options = config
            .run_options()
            .with_store(Arc::clone(&store))
            .with_locker(Arc::new(LocalCacheLocker::new()));
        if let Some(concurrency) = args.concurrency {
            options = options.with_concurrency(concurrency);
        }

        let bar = if args.no_progress_bar {
            let logger = LogProgressLogger::new()
                .with_store(store)
                .with_step_interval(Duration::from_millis(config.seed.step_interval_ms));
            options = options.with_logger(Arc::new(logger));
            None
        } else {
            let bar = Arc::new(BarProgressLogger::new().with_store(store));
            let logger: Arc<dyn ProgressLogger> = bar.clone();
            options = options.with_logger(logger);
            Some(bar)
        };

        let cancel = options.cancel.clone();
        ctrlc::set_handler(move || {
            eprintln!();
            eprintln!("Interrupted, finishing queued tiles...");
            cancel.cancel();
        })
        .map_err(|e| CliError::SignalHandler(e.to_string()))?;

        info!(
            config = %config_path.display(),
            cache = %cache.root().display(),
            progress_file = %progress_file.display(),
            resume = args.resume,
            "Session ready"
        );

        Ok(Self {
            config,
            cache,
            options,
            tasks: args.tasks.clone(),
            progress_file,
            bar,
        })
    }

    /// Prints the summary and turns the report into an exit status.
    pub fn finish(self, report: &RunReport) -> Result<(), CliError> {
        if let Some(bar) = &self.bar {
            bar.finish();
        }

        println!();
        println!("Tasks completed: {}", report.completed);
        println!("Tasks skipped:   {}", report.skipped);
        println!("Tasks failed:    {}", report.failed);
        println!("Work items:      {}", report.dispatched);

        if report.cancelled {
            return Err(CliError::Interrupted {
                progress_file: self.progress_file,
            });
        }
        if report.failed > 0 || report.skipped > 0 {
            return Err(CliError::TasksFailed {
                failed: report.failed,
                skipped: report.skipped,
            });
        }
        Ok(())
    }
}

/// Fails when the selection produced no task.
pub fn require_tasks<T>(tasks: Vec<T>) -> Result<Vec<T>, CliError> {
    if tasks.is_empty() {
        Err(CliError::NoTasks)
    } else {
        Ok(tasks)
    }
}
