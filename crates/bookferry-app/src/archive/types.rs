use std::path::PathBuf;
use std::time::Duration;

use bon::Builder;
use thiserror::Error;

use crate::dedup::RefreshPolicy;
use crate::progress::{ArchiveSummary, ProgressError};
use crate::remote::TargetError;

use super::staging::StagingError;

#[derive(Debug, Error)]
pub enum ArchiveWorkerError {
    #[error(transparent)]
    Staging(#[from] StagingError),
    #[error("remote mirror bootstrap failed: {0}")]
    MirrorBootstrap(#[source] TargetError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error("worker event channel closed")]
    ChannelClosed,
}

/// Tunables for one archive worker.
#[derive(Debug, Clone, Builder)]
pub struct ArchiveOptions {
    pub shard_id: u32,
    pub shard_count: u32,
    /// Archives assigned to this worker.
    pub archives: Vec<PathBuf>,
    /// Directory where archives are unpacked.
    pub staging_dir: PathBuf,
    #[builder(default = 1)]
    pub parallel_uploads: usize,
    /// Concurrent fingerprint computations feeding the serialized dedup
    /// filter.
    #[builder(default = default_fingerprint_parallelism())]
    pub fingerprint_parallelism: usize,
    /// Required free space in the staging filesystem before extraction.
    #[builder(default = 10 * 1024 * 1024 * 1024)]
    pub min_free_bytes: u64,
    /// Claim archives of dead peers once the own list drains.
    #[builder(default = true)]
    pub orphan_recovery: bool,
    #[builder(default = Duration::from_secs(30))]
    pub drain_deadline: Duration,
    #[builder(default)]
    pub refresh_policy: RefreshPolicy,
}

fn default_fingerprint_parallelism() -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2);
    (cores / 2).clamp(1, 4)
}

/// Whole-run totals for archive mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveRunSummary {
    pub archives_completed: u64,
    pub archives_reused: u64,
    pub orphans_claimed: u64,
    pub files_processed: u64,
    pub files_uploaded: u64,
    pub already_present: u64,
    pub errors: u64,
}

/// Progress events emitted while the archive worker runs.
#[derive(Debug, Clone)]
pub enum ArchiveEvent {
    Initialized {
        assigned: usize,
        mirror_size: usize,
    },
    ArchiveStarted {
        name: String,
        reused_extraction: bool,
    },
    ExtractionCompleted {
        name: String,
        files: usize,
    },
    RecordFinished {
        name: String,
        new_uploaded: bool,
    },
    ArchiveCompleted {
        name: String,
        summary: ArchiveSummary,
    },
    OrphanClaimed {
        name: String,
        from_shard: u32,
    },
    MirrorRefreshed {
        size: usize,
    },
    Paused,
    Draining {
        reason: String,
    },
    Completed {
        summary: ArchiveRunSummary,
    },
}
