use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors which stop a sweep before or outside of per-cell work
///
/// Failures of individual cells are never reported through this type, they are recorded in the
/// sweep report instead
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("results file {path} exists but can't be read back: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },

    #[error("simulator executable not found: {0}")]
    SimulatorNotFound(PathBuf),

    #[error("store for policy {store} can't hold a result for policy {cell}")]
    PolicyMismatch { store: String, cell: String },

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("couldn't install signal handler: {0}")]
    Signal(#[from] nix::Error),

    #[error("couldn't build worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
}

impl SweepError {
    /// Attaches a path to an I/O error
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SweepError::Io { path: path.into(), source }
    }
}

pub type Result<T, E = SweepError> = std::result::Result<T, E>;
