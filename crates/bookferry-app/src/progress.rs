//! Durable per-worker checkpoints.
//!
//! One worker owns exactly one progress file; peers and the supervisor only
//! ever read it. The file is human-readable JSON, and the loader recovers the
//! last complete object from a partially written tail so a hard kill during a
//! direct-write fallback cannot strand a worker.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, warn};

use crate::fingerprint::Fingerprint;

/// Minimum spacing between intra-batch commits.
pub const COMMIT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("failed to write progress file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode progress: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Terminal disposition of one file within a worker's run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CompletedStatus {
    Uploaded,
    AlreadyPresentRemote,
    AlreadyPresentLocal,
    Unresolvable,
}

/// Lifecycle state recorded in the progress file for the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum WorkerStatus {
    Initializing,
    Discovering,
    Processing,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedFile {
    pub path: String,
    pub status: CompletedStatus,
    pub ts: DateTime<Utc>,
}

/// Summary of one processed archive (archive mode only).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub files_processed: u64,
    pub files_uploaded: u64,
    pub errors: u64,
    /// Subset of `errors` that are retryable; a nonzero count keeps the
    /// archive off the completed set.
    #[serde(default)]
    pub transient_errors: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The durable checkpoint, serialized as pretty JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerProgress {
    pub shard_id: u32,
    pub shard_count: u32,
    pub last_processed_shard_key: i64,
    /// Fingerprint key (`hash:size`) to terminal disposition.
    #[serde(default)]
    pub completed_files: BTreeMap<String, CompletedFile>,
    #[serde(default)]
    pub last_uploaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_activity_at: Option<DateTime<Utc>>,
    pub status: WorkerStatus,
    /// Cumulative distance jumped by skip-ahead, so key monotonicity stays
    /// checkable across restarts.
    #[serde(default)]
    pub skip_ahead_total: i64,
    /// Set when an atomic rename failed and a direct write was used instead.
    #[serde(default)]
    pub dirty_write: bool,

    // Archive mode.
    #[serde(default)]
    pub assigned_archives: Vec<String>,
    #[serde(default)]
    pub completed_archives: BTreeSet<String>,
    #[serde(default)]
    pub current_archive: Option<String>,
    #[serde(default)]
    pub archive_progress: BTreeMap<String, ArchiveSummary>,
}

impl WorkerProgress {
    pub fn empty(shard_id: u32, shard_count: u32) -> Self {
        Self {
            shard_id,
            shard_count,
            last_processed_shard_key: 0,
            completed_files: BTreeMap::new(),
            last_uploaded_at: None,
            last_activity_at: None,
            status: WorkerStatus::Initializing,
            skip_ahead_total: 0,
            dirty_write: false,
            assigned_archives: Vec::new(),
            completed_archives: BTreeSet::new(),
            current_archive: None,
            archive_progress: BTreeMap::new(),
        }
    }

    /// Record a terminal outcome for a fingerprint. A fingerprint appears at
    /// most once; later outcomes do not overwrite an existing entry.
    pub fn record_completed(
        &mut self,
        fp: &Fingerprint,
        path: &Path,
        status: CompletedStatus,
    ) -> bool {
        let key = fp.key();
        if self.completed_files.contains_key(&key) {
            return false;
        }
        self.completed_files.insert(
            key,
            CompletedFile {
                path: path.display().to_string(),
                status,
                ts: Utc::now(),
            },
        );
        true
    }

    pub fn is_completed(&self, fp: &Fingerprint) -> bool {
        self.completed_files.contains_key(&fp.key())
    }

    /// Fingerprints this worker has resolved, for dedup layering.
    pub fn completed_fingerprints(&self) -> impl Iterator<Item = Fingerprint> + '_ {
        self.completed_files
            .keys()
            .filter_map(|key| key.parse::<Fingerprint>().ok())
    }

    pub fn touch_activity(&mut self, kind: ActivityKind) {
        let now = Utc::now();
        self.last_activity_at = Some(now);
        if kind == ActivityKind::Upload {
            self.last_uploaded_at = Some(now);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityKind {
    Upload,
    Other,
}

/// Handle owning one worker's progress file.
#[derive(Debug)]
pub struct ProgressStore {
    path: PathBuf,
    last_commit: Option<Instant>,
}

impl ProgressStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_commit: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the progress file, recovering from a corrupt tail; a missing file
    /// yields `None`.
    pub async fn load(&self, shard_id: u32, shard_count: u32) -> Option<WorkerProgress> {
        load_progress_file(&self.path)
            .await
            .filter(|p| p.shard_id == shard_id && p.shard_count == shard_count)
    }

    /// Atomically persist `progress`: temp file in the same directory, fsync,
    /// rename over the target. A failed rename degrades to a direct write and
    /// flags the event in the stored struct.
    pub async fn commit(&mut self, progress: &mut WorkerProgress) -> Result<(), ProgressError> {
        let encoded = serde_json::to_vec_pretty(progress)?;
        let tmp = self.path.with_extension("json.tmp");

        let write_err = |source, path: &Path| ProgressError::Write {
            path: path.to_path_buf(),
            source,
        };

        let atomic = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&encoded).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(source) = atomic {
            warn!(
                path = %self.path.display(),
                error = %source,
                "atomic progress commit failed; falling back to direct write"
            );
            progress.dirty_write = true;
            let encoded = serde_json::to_vec_pretty(progress)?;
            if let Err(source) = fs::write(&self.path, &encoded).await {
                error!(path = %self.path.display(), error = %source, "direct progress write failed");
                return Err(write_err(source, &self.path));
            }
        }

        self.last_commit = Some(Instant::now());
        Ok(())
    }

    /// Commit only if the last commit is older than [`COMMIT_INTERVAL`]; used
    /// for intra-batch checkpoints.
    pub async fn commit_throttled(
        &mut self,
        progress: &mut WorkerProgress,
    ) -> Result<bool, ProgressError> {
        let due = self
            .last_commit
            .map(|at| at.elapsed() >= COMMIT_INTERVAL)
            .unwrap_or(true);
        if due {
            self.commit(progress).await?;
        }
        Ok(due)
    }
}

/// Read any progress file (peer or own), tolerating a partially written
/// tail. Returns `None` when the file is absent or no complete object can be
/// recovered.
pub async fn load_progress_file(path: &Path) -> Option<WorkerProgress> {
    let content = fs::read_to_string(path).await.ok()?;
    match serde_json::from_str(&content) {
        Ok(progress) => Some(progress),
        Err(_) => {
            let recovered = recover_last_object(&content)?;
            warn!(
                path = %path.display(),
                "progress file had trailing garbage; recovered last complete object"
            );
            serde_json::from_str(recovered).ok()
        }
    }
}

/// Scan backwards from the last `}` for its balanced opening `{`, skipping
/// braces inside string literals.
fn recover_last_object(content: &str) -> Option<&str> {
    let bytes = content.as_bytes();
    let mut end = content.rfind('}')?;

    loop {
        let mut depth = 0i64;
        let mut start = None;
        let mut in_string = false;
        let mut i = end;
        loop {
            let b = bytes[i];
            // A backslash before a quote means the quote is escaped; JSON
            // escapes make a pure backwards scan approximate, so verify by
            // parsing before accepting the slice.
            if b == b'"' && (i == 0 || bytes[i - 1] != b'\\') {
                in_string = !in_string;
            } else if !in_string {
                if b == b'}' {
                    depth += 1;
                } else if b == b'{' {
                    depth -= 1;
                    if depth == 0 {
                        start = Some(i);
                        break;
                    }
                }
            }
            if i == 0 {
                break;
            }
            i -= 1;
        }

        if let Some(start) = start {
            let candidate = &content[start..=end];
            if serde_json::from_str::<serde_json::Value>(candidate).is_ok() {
                return Some(candidate);
            }
        }

        // Try the previous closing brace.
        end = content[..end].rfind('}')?;
    }
}
