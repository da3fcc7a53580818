//! CLI error handling with user-friendly messages.
//!
//! Centralizes error handling for the CLI, providing consistent formatting
//! and exit codes.

use std::fmt;
use std::path::PathBuf;
use std::process;

use tileseed::config::ConfigFileError;
use tileseed::progress::StoreError;

/// Exit code after Ctrl-C, as shells report for SIGINT.
pub const EXIT_INTERRUPTED: i32 = 130;

/// CLI-specific errors with user-friendly messages.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging
    LoggingInit(std::io::Error),
    /// Unusable configuration file or settings
    Config(ConfigFileError),
    /// Progress file could not be read
    Progress(StoreError),
    /// Ctrl-C handler could not be installed
    SignalHandler(String),
    /// No task matched
    NoTasks,
    /// Some tasks failed or were skipped as invalid
    TasksFailed { failed: usize, skipped: usize },
    /// The run was cancelled; progress was saved
    Interrupted { progress_file: PathBuf },
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Interrupted { .. } => EXIT_INTERRUPTED,
            _ => 1,
        }
    }

    /// Exit the process with an error message and code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {}", self);

        match self {
            CliError::Interrupted { .. } => {
                eprintln!();
                eprintln!("Run the same command with --continue to resume.");
            }
            CliError::NoTasks => {
                eprintln!();
                eprintln!("Add a [task.<name>] section to the configuration file.");
            }
            _ => {}
        }

        process::exit(self.exit_code())
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::LoggingInit(e) => write!(f, "Failed to initialize logging: {}", e),
            CliError::Config(e) => write!(f, "{}", e),
            CliError::Progress(e) => write!(f, "Failed to read progress file: {}", e),
            CliError::SignalHandler(msg) => write!(f, "Failed to set signal handler: {}", msg),
            CliError::NoTasks => write!(f, "No tasks to run"),
            CliError::TasksFailed { failed, skipped } => {
                write!(f, "{} task(s) failed, {} skipped", failed, skipped)
            }
            CliError::Interrupted { progress_file } => {
                write!(f, "Interrupted, progress saved to {}", progress_file.display())
            }
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::LoggingInit(e) => Some(e),
            CliError::Config(e) => Some(e),
            CliError::Progress(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigFileError> for CliError {
    fn from(e: ConfigFileError) -> Self {
        CliError::Config(e)
    }
}

impl From<StoreError> for CliError {
    fn from(e: StoreError) -> Self {
        CliError::Progress(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        let interrupted = CliError::Interrupted {
            progress_file: PathBuf::from("/tmp/progress.json"),
        };
        assert_eq!(interrupted.exit_code(), EXIT_INTERRUPTED);
        assert_eq!(CliError::NoTasks.exit_code(), 1);
        assert_eq!(
            CliError::TasksFailed {
                failed: 1,
                skipped: 0
            }
            .exit_code(),
            1
        );
    }

    #[test]
    fn test_messages() {
        let err = CliError::TasksFailed {
            failed: 2,
            skipped: 1,
        };
        assert_eq!(err.to_string(), "2 task(s) failed, 1 skipped");

        let err = CliError::from(ConfigFileError::UnknownTask("europe".to_string()));
        assert!(err.to_string().contains("europe"));
    }
}
