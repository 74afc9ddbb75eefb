use std::path::PathBuf;

use thiserror::Error;

/// Problems with the grid configuration document itself.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config document has no `{0}` subtree")]
    MissingParams(String),
    #[error("malformed sweep at {path}: {reason}")]
    MalformedSweep { path: String, reason: String },
    #[error("key path {path} crosses a non-mapping value at `{segment}`")]
    PathConflict { path: String, segment: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Failures raised while driving runs. Both are fatal for the whole grid.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("virtual environment not found: {}", .path.display())]
    EnvironmentMissing { path: PathBuf },
    #[error("run {run_id} failed: {reason}")]
    RunFailed { run_id: String, reason: String },
}
