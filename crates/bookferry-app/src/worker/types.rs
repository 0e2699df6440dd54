use std::time::Duration;

use bon::Builder;
use thiserror::Error;

use crate::catalog::CatalogError;
use crate::dedup::RefreshPolicy;
use crate::progress::ProgressError;
use crate::remote::TargetError;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error("remote mirror bootstrap failed: {0}")]
    MirrorBootstrap(#[source] TargetError),
    #[error(transparent)]
    Progress(#[from] ProgressError),
    #[error("worker event channel closed")]
    ChannelClosed,
}

/// Tunables for one worker process.
#[derive(Debug, Clone, Builder)]
pub struct WorkerOptions {
    pub shard_id: u32,
    pub shard_count: u32,
    /// Catalog records fetched per batch.
    #[builder(default = 1_000)]
    pub batch_size: usize,
    /// Concurrent uploads within this worker (1..=10).
    #[builder(default = 1)]
    pub parallel_uploads: usize,
    /// Operator override for the resume key; a deliberate jump, exempt from
    /// the monotonicity invariant.
    pub last_key_override: Option<i64>,
    /// Stop after this many records in this invocation.
    pub limit: Option<u64>,
    /// Upload by path reference instead of streaming bytes.
    #[builder(default = false)]
    pub use_symlinks: bool,
    /// Consecutive zero-new batches before a skip-ahead jump.
    #[builder(default = 5)]
    pub skip_ahead_after: u32,
    /// Key distance of one skip-ahead jump.
    #[builder(default = 10_000)]
    pub skip_ahead_stride: i64,
    /// How long a drain may take once shutdown is requested.
    #[builder(default = Duration::from_secs(30))]
    pub drain_deadline: Duration,
    #[builder(default)]
    pub refresh_policy: RefreshPolicy,
}

/// Per-batch outcome counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub records: u64,
    pub new_uploaded: u64,
    pub already_present: u64,
    pub skipped_local: u64,
    pub permanent_failures: u64,
    pub transient_failures: u64,
}

/// Whole-run totals, reported with the final event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerSummary {
    pub batches: u64,
    pub records: u64,
    pub new_uploaded: u64,
    pub already_present: u64,
    pub skipped_local: u64,
    pub permanent_failures: u64,
    pub transient_failures: u64,
    pub skip_aheads: u32,
    pub last_processed_shard_key: i64,
}

impl WorkerSummary {
    pub(crate) fn absorb(&mut self, batch: &BatchStats) {
        self.batches += 1;
        self.records += batch.records;
        self.new_uploaded += batch.new_uploaded;
        self.already_present += batch.already_present;
        self.skipped_local += batch.skipped_local;
        self.permanent_failures += batch.permanent_failures;
        self.transient_failures += batch.transient_failures;
    }
}

/// Progress events emitted while the worker runs.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// Initialization finished: caches are built and the target is reachable.
    Initialized {
        resumed_key: i64,
        mirror_size: usize,
        total_catalog: Option<u64>,
    },
    BatchStarted {
        index: u64,
        after_key: i64,
        size: usize,
    },
    /// One record reached a terminal state.
    RecordFinished {
        shard_key: i64,
        new_uploaded: bool,
    },
    /// An individual upload exceeded the slow threshold.
    SlowUpload {
        shard_key: i64,
        elapsed: Duration,
    },
    /// Rolling rate metric, emitted every 100 new uploads.
    UploadRate {
        uploads_per_minute: f64,
    },
    BatchCompleted {
        index: u64,
        stats: BatchStats,
        advanced_to: i64,
    },
    /// The worker jumped over a fully migrated key range.
    SkipAhead {
        from: i64,
        to: i64,
    },
    MirrorRefreshed {
        size: usize,
    },
    /// Supervisor pause flag honored; the worker halts after this event.
    Paused,
    Draining {
        reason: String,
    },
    Completed {
        summary: WorkerSummary,
    },
}
