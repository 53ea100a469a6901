use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by the shard archive container.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Zip error on {path}: {source}")]
    Zip {
        path: PathBuf,
        source: zip::result::ZipError,
    },
    #[error("Invalid shard index in {path}: {source}")]
    Index {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to replace {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Per-file failure of a transform. The file is left uncommitted.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Failed to open {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to copy {path}: {source}")]
    Copy {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to launch {tool}: {source}")]
    Launch {
        tool: String,
        source: std::io::Error,
    },
    #[error("{tool} produced no output at {output}")]
    EmptyOutput { tool: String, output: PathBuf },
    #[error("{0}")]
    Rejected(String),
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Fatal errors: these abort a worker (and a synchronous cook).
#[derive(Debug, Error)]
pub enum CookError {
    #[error("Invalid file mask {mask:?}: {source}")]
    Mask {
        mask: String,
        source: glob::PatternError,
    },
    #[error("Cannot resolve project root: {0}")]
    Root(std::io::Error),
    #[error("Cannot open {path} for updating: {source}")]
    ShardOpen { path: PathBuf, source: ArchiveError },
    #[error("Failed to add {name} into {path}: {source}")]
    Commit {
        path: PathBuf,
        name: String,
        source: ArchiveError,
    },
    #[error("Cannot open scratch file for writing: {0}")]
    Scratch(std::io::Error),
    #[error("Failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: usize,
        source: std::io::Error,
    },
    #[error("Worker {0} panicked")]
    WorkerPanicked(usize),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
