//! Single-upload execution: pre-check, watchdog, bounded retries, and
//! outcome classification.
//!
//! Failures are data, not exceptions: every path through here terminates in
//! an [`UploadOutcome`] and the worker decides what a transient exhaustion
//! means for the record.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::fingerprint::Fingerprint;
use crate::metadata::BookMeta;
use crate::remote::{TargetClient, TargetError, TransferProgress, UploadSource, UploadStatus};

/// Server-side size cap; larger files are rejected without a request.
pub const MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;

/// Uploads slower than this are flagged in metrics.
pub const SLOW_UPLOAD: Duration = Duration::from_secs(120);

const RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
];

/// Terminal classification of one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    NewUploaded,
    AlreadyPresent,
    TransientFailure(String),
    PermanentFailure(String),
}

impl UploadOutcome {
    /// Both success variants terminate the record for the worker.
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::NewUploaded | UploadOutcome::AlreadyPresent)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, UploadOutcome::TransientFailure(_))
    }
}

/// Watchdog thresholds for one upload attempt.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogConfig {
    /// How often progress signals are sampled.
    pub probe_interval: Duration,
    /// An attempt with no signal movement for this long is stuck.
    pub stall_after: Duration,
    /// Absolute ceiling for one attempt, signals or not.
    pub hard_timeout: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(60),
            stall_after: Duration::from_secs(240),
            hard_timeout: Duration::from_secs(600),
        }
    }
}

/// One fully prepared upload.
#[derive(Debug, Clone)]
pub struct UploadJob {
    pub fingerprint: Fingerprint,
    pub meta: BookMeta,
    pub source: UploadSource,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UploadTiming {
    pub attempts: u32,
    pub elapsed: Duration,
}

impl UploadTiming {
    pub fn is_slow(&self) -> bool {
        self.elapsed >= SLOW_UPLOAD
    }
}

/// Executes uploads against the target service.
#[derive(Clone)]
pub struct Uploader {
    client: Arc<dyn TargetClient>,
    watchdog: WatchdogConfig,
    precheck: bool,
}

impl Uploader {
    pub fn new(client: Arc<dyn TargetClient>, watchdog: WatchdogConfig, precheck: bool) -> Self {
        Self {
            client,
            watchdog,
            precheck,
        }
    }

    /// Run one upload with the documented retry schedule. Returns the outcome
    /// plus timing for the slow-upload metric.
    pub async fn upload(&self, job: &UploadJob) -> (UploadOutcome, UploadTiming) {
        let started = Instant::now();
        let mut timing = UploadTiming::default();

        if job.fingerprint.size > MAX_UPLOAD_BYTES {
            timing.elapsed = started.elapsed();
            return (
                UploadOutcome::PermanentFailure(format!(
                    "file exceeds server cap ({} bytes)",
                    job.fingerprint.size
                )),
                timing,
            );
        }

        if self.precheck {
            match self.client.exists(&job.fingerprint).await {
                Ok(true) => {
                    timing.elapsed = started.elapsed();
                    return (UploadOutcome::AlreadyPresent, timing);
                }
                Ok(false) => {}
                // The pre-check is an optimization; a failing one never
                // blocks the upload itself.
                Err(err) => debug!(error = %err, "fingerprint pre-check failed; uploading anyway"),
            }
        }

        let mut outcome = self.attempt(job).await;
        timing.attempts = 1;

        for delay in RETRY_DELAYS {
            let UploadOutcome::TransientFailure(reason) = &outcome else {
                break;
            };
            warn!(
                fingerprint = %job.fingerprint,
                reason = %reason,
                retry_in_secs = delay.as_secs(),
                "transient upload failure; retrying"
            );
            sleep(delay).await;
            outcome = self.attempt(job).await;
            timing.attempts += 1;
        }

        timing.elapsed = started.elapsed();
        (outcome, timing)
    }

    /// One watched attempt.
    async fn attempt(&self, job: &UploadJob) -> UploadOutcome {
        let progress = TransferProgress::new();
        let fut = self.client.upload(&job.meta, &job.source, &progress);

        let watched = watch_for_stall(fut, &progress, self.watchdog);
        match timeout(self.watchdog.hard_timeout, watched).await {
            Ok(Some(result)) => classify(result),
            Ok(None) => UploadOutcome::TransientFailure("stuck".to_string()),
            Err(_) => UploadOutcome::TransientFailure(format!(
                "exceeded hard ceiling of {}s",
                self.watchdog.hard_timeout.as_secs()
            )),
        }
    }
}

/// Drive `fut` while sampling the transfer counter every `probe_interval`.
/// Returns `None` when no signal advanced for `stall_after`.
async fn watch_for_stall<F>(
    fut: F,
    progress: &TransferProgress,
    config: WatchdogConfig,
) -> Option<Result<crate::remote::UploadReceipt, TargetError>>
where
    F: std::future::Future<Output = Result<crate::remote::UploadReceipt, TargetError>>,
{
    tokio::pin!(fut);
    let mut last_bytes = progress.bytes();
    let mut stalled = Duration::ZERO;

    loop {
        tokio::select! {
            result = &mut fut => return Some(result),
            _ = sleep(config.probe_interval) => {
                let now_bytes = progress.bytes();
                if now_bytes == last_bytes {
                    stalled += config.probe_interval;
                    if stalled >= config.stall_after {
                        return None;
                    }
                } else {
                    stalled = Duration::ZERO;
                    last_bytes = now_bytes;
                }
            }
        }
    }
}

/// Map a target response or error onto the outcome sum type.
fn classify(result: Result<crate::remote::UploadReceipt, TargetError>) -> UploadOutcome {
    match result {
        Ok(receipt) => match receipt.status {
            UploadStatus::New => UploadOutcome::NewUploaded,
            UploadStatus::Duplicate => UploadOutcome::AlreadyPresent,
            UploadStatus::SizeRejected => {
                UploadOutcome::PermanentFailure("file rejected for size".to_string())
            }
            UploadStatus::ValidationRejected => {
                UploadOutcome::PermanentFailure("metadata rejected".to_string())
            }
            UploadStatus::ServerError => {
                UploadOutcome::TransientFailure("server reported internal error".to_string())
            }
        },
        Err(err) if err.is_transient() => UploadOutcome::TransientFailure(err.to_string()),
        Err(err) => UploadOutcome::PermanentFailure(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::UploadReceipt;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Scripted target: pops the next response per upload call.
    struct ScriptedTarget {
        exists: bool,
        script: Mutex<Vec<Result<UploadStatus, TargetError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTarget {
        fn new(exists: bool, script: Vec<Result<UploadStatus, TargetError>>) -> Self {
            Self {
                exists,
                script: Mutex::new(script),
                calls: Mutex::new(0),
            }
        }

        fn upload_calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl TargetClient for ScriptedTarget {
        async fn exists(&self, _fp: &Fingerprint) -> Result<bool, TargetError> {
            Ok(self.exists)
        }

        async fn all_fingerprints(&self) -> Result<HashSet<Fingerprint>, TargetError> {
            Ok(HashSet::new())
        }

        async fn upload(
            &self,
            _meta: &BookMeta,
            _source: &UploadSource,
            _progress: &TransferProgress,
        ) -> Result<UploadReceipt, TargetError> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            let next = if script.is_empty() {
                Ok(UploadStatus::New)
            } else {
                script.remove(0)
            };
            next.map(|status| UploadReceipt {
                status,
                server_fingerprint: None,
            })
        }
    }

    fn job() -> UploadJob {
        UploadJob {
            fingerprint: Fingerprint::new("ab12", 100),
            meta: BookMeta::default(),
            source: UploadSource::PathRef("/library/x.epub".into()),
        }
    }

    fn uploader(target: Arc<ScriptedTarget>) -> Uploader {
        Uploader::new(target, WatchdogConfig::default(), true)
    }

    #[tokio::test]
    async fn precheck_hit_short_circuits() {
        let target = Arc::new(ScriptedTarget::new(true, vec![]));
        let (outcome, _) = uploader(Arc::clone(&target)).upload(&job()).await;
        assert_eq!(outcome, UploadOutcome::AlreadyPresent);
        assert_eq!(target.upload_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_then_succeed() {
        let target = Arc::new(ScriptedTarget::new(
            false,
            vec![
                Ok(UploadStatus::ServerError),
                Ok(UploadStatus::ServerError),
                Ok(UploadStatus::New),
            ],
        ));
        let (outcome, timing) = uploader(Arc::clone(&target)).upload(&job()).await;
        assert_eq!(outcome, UploadOutcome::NewUploaded);
        assert_eq!(timing.attempts, 3);
        assert_eq!(target.upload_calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_budget_is_exhausted_after_four_attempts() {
        let target = Arc::new(ScriptedTarget::new(
            false,
            vec![
                Ok(UploadStatus::ServerError),
                Ok(UploadStatus::ServerError),
                Ok(UploadStatus::ServerError),
                Ok(UploadStatus::ServerError),
                Ok(UploadStatus::New),
            ],
        ));
        let (outcome, timing) = uploader(Arc::clone(&target)).upload(&job()).await;
        assert!(matches!(outcome, UploadOutcome::TransientFailure(_)));
        assert_eq!(timing.attempts, 4);
        assert_eq!(target.upload_calls(), 4);
    }

    #[tokio::test]
    async fn permanent_failure_does_not_retry() {
        let target = Arc::new(ScriptedTarget::new(
            false,
            vec![Ok(UploadStatus::ValidationRejected)],
        ));
        let (outcome, _) = uploader(Arc::clone(&target)).upload(&job()).await;
        assert!(matches!(outcome, UploadOutcome::PermanentFailure(_)));
        assert_eq!(target.upload_calls(), 1);
    }

    #[tokio::test]
    async fn oversize_file_is_rejected_locally() {
        let target = Arc::new(ScriptedTarget::new(false, vec![]));
        let mut oversize = job();
        oversize.fingerprint.size = MAX_UPLOAD_BYTES + 1;
        let (outcome, _) = uploader(Arc::clone(&target)).upload(&oversize).await;
        assert!(matches!(outcome, UploadOutcome::PermanentFailure(_)));
        assert_eq!(target.upload_calls(), 0);
    }

    struct HangingTarget;

    #[async_trait]
    impl TargetClient for HangingTarget {
        async fn exists(&self, _fp: &Fingerprint) -> Result<bool, TargetError> {
            Ok(false)
        }

        async fn all_fingerprints(&self) -> Result<HashSet<Fingerprint>, TargetError> {
            Ok(HashSet::new())
        }

        async fn upload(
            &self,
            _meta: &BookMeta,
            _source: &UploadSource,
            _progress: &TransferProgress,
        ) -> Result<UploadReceipt, TargetError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_upload_is_killed_by_watchdog() {
        let watchdog = WatchdogConfig {
            probe_interval: Duration::from_millis(50),
            stall_after: Duration::from_millis(150),
            hard_timeout: Duration::from_secs(600),
        };
        let uploader = Uploader::new(Arc::new(HangingTarget), watchdog, false);
        let (outcome, _) = uploader.upload(&job()).await;
        // No signals ever advance, so every attempt dies as stuck and the
        // retry budget drains.
        assert!(matches!(outcome, UploadOutcome::TransientFailure(ref r) if r == "stuck"));
    }

    #[tokio::test(start_paused = true)]
    async fn hard_ceiling_caps_an_attempt() {
        let watchdog = WatchdogConfig {
            probe_interval: Duration::from_secs(60),
            stall_after: Duration::from_secs(100_000),
            hard_timeout: Duration::from_millis(200),
        };
        let uploader = Uploader::new(Arc::new(HangingTarget), watchdog, false);
        let (outcome, _) = uploader.upload(&job()).await;
        assert!(matches!(outcome, UploadOutcome::TransientFailure(ref r) if r.contains("ceiling")));
    }
}
