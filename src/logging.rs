//! Tracing setup for the `cook` binary.
//!
//! Synchronous runs log to stdout. The dashboard owns the terminal, so
//! asynchronous runs send the log to a file under the project root instead.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing_subscriber::{fmt, prelude::*, EnvFilter, Registry};

pub const LOG_FILE: &str = ".cook.log";

#[derive(Debug, Clone)]
pub enum LogTarget {
    Stdout,
    File(PathBuf),
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to create log file at {path}: {source}")]
    CreateLogFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to install global tracing subscriber: {0}")]
    SetGlobal(#[from] tracing_subscriber::util::TryInitError),
}

/// Installs the global subscriber. `RUST_LOG` overrides the `info` default.
pub fn init(target: LogTarget) -> Result<(), LoggingError> {
    let registry = Registry::default().with(build_env_filter());
    match target {
        LogTarget::Stdout => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stdout))
            .try_init()?,
        LogTarget::File(path) => {
            let file = open_log(&path)?;
            registry
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_thread_names(true)
                        .with_writer(Mutex::new(file)),
                )
                .try_init()?;
        }
    }
    Ok(())
}

fn build_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

fn open_log(path: &Path) -> Result<File, LoggingError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LoggingError::CreateLogFile {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_file_keeps_previous_runs() {
        use std::io::Write;

        let dir = tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        std::fs::write(&path, b"previous run\n").unwrap();
        open_log(&path).unwrap().write_all(b"next run\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "previous run\nnext run\n"
        );
    }
}
