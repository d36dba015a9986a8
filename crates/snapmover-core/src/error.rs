use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Disk usage probe failed: {0}")]
    Probe(#[from] ProbeError),

    /// The metadata store could not be trusted. Recovered by a full rescan.
    #[error("Metadata store is corrupt: {0}")]
    MetadataCorrupt(String),

    #[error("Unable to classify cache files: {0}")]
    Classification(String),

    #[error("Preflight check failed: {0}")]
    Preflight(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("{} does not exist", .0.display())]
    Missing(PathBuf),

    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    #[error("{} is not a mount point", .0.display())]
    NotAMountPoint(PathBuf),

    #[error("statvfs on {} failed: {source}", .path.display())]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} reports zero capacity", .0.display())]
    ZeroCapacity(PathBuf),
}

/// Per-file failure. Never fatal to a run.
#[derive(Error, Debug)]
pub enum MoveError {
    /// The copy did not complete. The source is untouched.
    #[error("transfer of {} failed: {reason}", .path.display())]
    Transfer { path: PathBuf, reason: String },

    /// The destination does not match the source. The destination was removed
    /// and the source is untouched.
    #[error("verification of {} failed: {reason}", .path.display())]
    Verify { path: PathBuf, reason: String },

    /// The copy was verified but the source could not be removed, so the data
    /// now exists in both pools.
    #[error("copied {} but could not remove the source: {source}", .path.display())]
    SourceDelete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MoveError {
    /// Partial successes leave duplicated data behind and need manual cleanup.
    pub fn is_partial(&self) -> bool {
        matches!(self, MoveError::SourceDelete { .. })
    }
}
