//! Supervisor error type.

use std::path::PathBuf;

use thiserror::Error;

use crate::config::MonitorConfigError;
use crate::diskio::DiskIoError;
use crate::fixes::FixError;
use crate::history::HistoryError;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Config(#[from] MonitorConfigError),
    #[error(transparent)]
    Paths(#[from] bookferry_app::paths::PathError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Fix(#[from] FixError),
    #[error(transparent)]
    DiskIo(#[from] DiskIoError),
    #[error(transparent)]
    Oracle(#[from] oracle_ox::OracleError),
    #[error("failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
