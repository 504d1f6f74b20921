use std::io;
use std::path::PathBuf;

use spatia_sync::SyncError;
use thiserror::Error;

use crate::telemetry::InitError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Sync(#[from] SyncError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("failed to load scene {path:?}: {source}")]
    Scene { path: PathBuf, source: SyncError },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported HTTP method '{0}'")]
    InvalidMethod(String),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
}
