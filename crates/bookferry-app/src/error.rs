//! Application-level error type shared across binaries.

use std::path::PathBuf;

use thiserror::Error;

use crate::archive::{ArchiveWorkerError, StagingError};
use crate::catalog::CatalogError;
use crate::config;
use crate::metadata::MetadataError;
use crate::paths::PathError;
use crate::progress::ProgressError;
use crate::remote::TargetError;
use crate::worker::WorkerError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    ConfigLoad(#[from] config::AppConfigError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error(transparent)]
    Paths(#[from] PathError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Target(#[from] TargetError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Archive(#[from] ArchiveWorkerError),
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("failed to read input {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no tar archives found under {path}")]
    NoArchives { path: PathBuf },
    #[error("shard id {shard_id} must be below shard count {shard_count}")]
    ShardOutOfRange { shard_id: u32, shard_count: u32 },
}
