use std::collections::{HashSet, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use async_stream::try_stream;
use backon::{ExponentialBuilder, Retryable};
use futures_util::stream::Stream;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::types::{BatchStats, WorkerError, WorkerEvent, WorkerOptions, WorkerSummary};
use crate::catalog::{SourceCatalog, SourceRecord};
use crate::dedup::DedupCache;
use crate::fingerprint::{Fingerprint, fingerprint_file};
use crate::metadata::{BookMeta, MetadataExtractor};
use crate::paths::RunPaths;
use crate::progress::{
    ActivityKind, CompletedStatus, ProgressStore, WorkerProgress, WorkerStatus, load_progress_file,
};
use crate::remote::{TargetClient, UploadSource};
use crate::uploader::{UploadJob, UploadOutcome, UploadTiming, Uploader};

const RATE_SAMPLE_EVERY: u64 = 100;

enum EventMessage {
    Event(WorkerEvent),
    Error(WorkerError),
}

type EventSender = mpsc::Sender<EventMessage>;

async fn send_event(sender: &EventSender, event: WorkerEvent) -> Result<(), WorkerError> {
    sender
        .send(EventMessage::Event(event))
        .await
        .map_err(|_| WorkerError::ChannelClosed)
}

/// Union of peer workers' completed fingerprints, skipping our own file and
/// tolerating partially written peers.
pub async fn collect_peer_fingerprints(paths: &RunPaths, own_shard: u32) -> HashSet<Fingerprint> {
    let mut union = HashSet::new();
    for (shard_id, path) in paths.list_progress_files() {
        if shard_id == own_shard {
            continue;
        }
        if let Some(peer) = load_progress_file(&path).await {
            union.extend(peer.completed_fingerprints());
        }
    }
    union
}

/// One shard worker. Owns its progress file exclusively; all cross-worker
/// knowledge arrives through peer progress files and the remote mirror.
pub struct Worker {
    catalog: Arc<dyn SourceCatalog>,
    target: Arc<dyn TargetClient>,
    uploader: Uploader,
    extractor: MetadataExtractor,
    paths: RunPaths,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(
        catalog: Arc<dyn SourceCatalog>,
        target: Arc<dyn TargetClient>,
        uploader: Uploader,
        extractor: MetadataExtractor,
        paths: RunPaths,
        options: WorkerOptions,
    ) -> Self {
        Self {
            catalog,
            target,
            uploader,
            extractor,
            paths,
            options,
        }
    }

    /// Run the worker, yielding progress events. The returned stream ends
    /// with [`WorkerEvent::Completed`] on any orderly exit.
    pub fn run_stream(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> impl Stream<Item = Result<WorkerEvent, WorkerError>> {
        let (event_tx, event_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let tx = event_tx.clone();
            if let Err(err) = self.drive(shutdown, event_tx).await {
                let _ = tx.send(EventMessage::Error(err)).await;
            }
        });

        try_stream! {
            let mut rx = event_rx;
            while let Some(message) = rx.recv().await {
                match message {
                    EventMessage::Event(event) => {
                        let done = matches!(event, WorkerEvent::Completed { .. });
                        yield event;
                        if done {
                            break;
                        }
                    }
                    EventMessage::Error(err) => Err(err)?,
                }
            }
        }
    }

    async fn drive(
        self,
        shutdown: watch::Receiver<bool>,
        events: EventSender,
    ) -> Result<(), WorkerError> {
        let mut run = self.initialize(&events).await?;

        let mut stopped = false;
        while !stopped {
            if run.pause_requested() {
                run.progress.status = WorkerStatus::Paused;
                run.store.commit(&mut run.progress).await?;
                send_event(&events, WorkerEvent::Paused).await?;
                break;
            }
            if *shutdown.borrow() {
                send_event(
                    &events,
                    WorkerEvent::Draining {
                        reason: "shutdown requested".to_string(),
                    },
                )
                .await?;
                break;
            }

            run.progress.status = WorkerStatus::Discovering;
            run.progress.touch_activity(ActivityKind::Other);
            let after_key = run.progress.last_processed_shard_key;
            let batch = run.fetch_batch(after_key).await?;
            info!(
                shard_id = run.options.shard_id,
                after_key,
                found = batch.len(),
                "fetched catalog batch"
            );
            if batch.is_empty() {
                send_event(
                    &events,
                    WorkerEvent::Draining {
                        reason: "catalog exhausted for this shard".to_string(),
                    },
                )
                .await?;
                break;
            }

            run.batch_index += 1;
            send_event(
                &events,
                WorkerEvent::BatchStarted {
                    index: run.batch_index,
                    after_key,
                    size: batch.len(),
                },
            )
            .await?;

            run.progress.status = WorkerStatus::Processing;
            let (stats, advance_to, pinned_key, stop) =
                run.process_batch(batch, &events, &shutdown).await?;
            stopped = stop;

            run.progress.last_processed_shard_key =
                run.progress.last_processed_shard_key.max(advance_to);

            // A record pinned at the same key across consecutive rounds is
            // not making progress, no matter how much of the refetched batch
            // re-resolves against the cache around it. After two such rounds
            // yield and let the supervisor decide.
            if pinned_key.is_some() && pinned_key == run.last_pinned_key {
                run.no_progress_batches += 1;
            } else {
                run.no_progress_batches = 0;
            }
            run.last_pinned_key = pinned_key;
            run.summary.absorb(&stats);
            run.summary.last_processed_shard_key = run.progress.last_processed_shard_key;

            if stats.new_uploaded == 0 {
                run.zero_new_batches += 1;
                // A dry batch often means a peer already covered the range;
                // refresh our picture of them.
                let peers = collect_peer_fingerprints(&run.paths, run.options.shard_id).await;
                run.cache.reload_peers(peers);
            } else {
                run.zero_new_batches = 0;
            }

            send_event(
                &events,
                WorkerEvent::BatchCompleted {
                    index: run.batch_index,
                    stats,
                    advanced_to: run.progress.last_processed_shard_key,
                },
            )
            .await?;

            if run.zero_new_batches >= run.options.skip_ahead_after {
                let from = run.progress.last_processed_shard_key;
                let to = from + run.options.skip_ahead_stride;
                run.progress.last_processed_shard_key = to;
                run.progress.skip_ahead_total += run.options.skip_ahead_stride;
                run.summary.skip_aheads += 1;
                run.summary.last_processed_shard_key = to;
                run.zero_new_batches = 0;
                info!(shard_id = run.options.shard_id, from, to, "skip-ahead jump");
                send_event(&events, WorkerEvent::SkipAhead { from, to }).await?;
            }

            run.store.commit(&mut run.progress).await?;

            if run.no_progress_batches >= 2 {
                send_event(
                    &events,
                    WorkerEvent::Draining {
                        reason: "transient failures persist; yielding to supervisor".to_string(),
                    },
                )
                .await?;
                break;
            }
        }

        run.store.commit(&mut run.progress).await?;
        let summary = run.summary;
        send_event(&events, WorkerEvent::Completed { summary }).await?;
        Ok(())
    }

    async fn initialize(self, events: &EventSender) -> Result<Run, WorkerError> {
        let options = self.options;
        let store_path = self.paths.progress_file(options.shard_id);
        let mut store = ProgressStore::new(store_path);

        let mut progress = store
            .load(options.shard_id, options.shard_count)
            .await
            .unwrap_or_else(|| WorkerProgress::empty(options.shard_id, options.shard_count));
        if let Some(key) = options.last_key_override {
            info!(
                shard_id = options.shard_id,
                key, "operator override for resume key"
            );
            progress.last_processed_shard_key = key;
        }
        progress.status = WorkerStatus::Initializing;
        progress.touch_activity(ActivityKind::Other);
        store.commit(&mut progress).await?;

        let mut cache = DedupCache::new(options.refresh_policy);
        cache.seed_local(&progress);
        cache.reload_peers(collect_peer_fingerprints(&self.paths, options.shard_id).await);

        // The mirror bootstrap doubles as the reachability check: a worker
        // that cannot list fingerprints cannot upload either.
        let target = Arc::clone(&self.target);
        let mirror = (|| async { target.all_fingerprints().await })
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(std::time::Duration::from_secs(1))
                    .with_max_times(3)
                    .with_jitter(),
            )
            .when(|err| err.is_transient())
            .await
            .map_err(WorkerError::MirrorBootstrap)?;
        let mirror_size = mirror.len();
        cache.apply_mirror(mirror);

        let total_catalog = self.catalog.count_total().await.ok();

        send_event(
            events,
            WorkerEvent::Initialized {
                resumed_key: progress.last_processed_shard_key,
                mirror_size,
                total_catalog,
            },
        )
        .await?;

        Ok(Run {
            catalog: self.catalog,
            target: self.target,
            uploader: self.uploader,
            extractor: self.extractor,
            paths: self.paths,
            options,
            store,
            progress,
            cache,
            summary: WorkerSummary::default(),
            batch_index: 0,
            zero_new_batches: 0,
            no_progress_batches: 0,
            last_pinned_key: None,
            records_taken: 0,
            new_uploads_total: 0,
            started_at: Instant::now(),
        })
    }
}

/// Live state of one worker run. All mutation happens on the driver task, so
/// progress and cache need no further synchronization.
struct Run {
    catalog: Arc<dyn SourceCatalog>,
    target: Arc<dyn TargetClient>,
    uploader: Uploader,
    extractor: MetadataExtractor,
    paths: RunPaths,
    options: WorkerOptions,
    store: ProgressStore,
    progress: WorkerProgress,
    cache: DedupCache,
    summary: WorkerSummary,
    batch_index: u64,
    zero_new_batches: u32,
    no_progress_batches: u32,
    /// Key of the first unterminated record from the previous batch, if any.
    last_pinned_key: Option<i64>,
    records_taken: u64,
    new_uploads_total: u64,
    started_at: Instant,
}

type UploadTaskResult = (i64, Fingerprint, PathBuf, UploadOutcome, UploadTiming);

impl Run {
    fn pause_requested(&self) -> bool {
        self.paths.pause_flag(self.options.shard_id).exists()
    }

    fn limit_reached(&self) -> bool {
        self.options
            .limit
            .map(|limit| self.records_taken >= limit)
            .unwrap_or(false)
    }

    async fn fetch_batch(&self, after_key: i64) -> Result<Vec<SourceRecord>, WorkerError> {
        let catalog = Arc::clone(&self.catalog);
        let options = self.options.clone();
        let batch = (move || {
            let catalog = Arc::clone(&catalog);
            let options = options.clone();
            async move {
                catalog
                    .next_batch(
                        options.shard_id,
                        options.shard_count,
                        after_key,
                        options.batch_size,
                    )
                    .await
            }
        })
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(std::time::Duration::from_millis(500))
                .with_max_times(3)
                .with_jitter(),
        )
        .notify(|err, delay| {
            warn!(error = %err, retry_in = ?delay, "catalog query failed; retrying");
        })
        .await?;
        Ok(batch)
    }

    /// Process one batch: sequential dedup/fingerprint/extract feeding a
    /// bounded upload pool. Returns the batch stats, the highest key the
    /// checkpoint may advance to, the key of the first unterminated record
    /// (if any), and whether the run should stop.
    async fn process_batch(
        &mut self,
        batch: Vec<SourceRecord>,
        events: &EventSender,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(BatchStats, i64, Option<i64>, bool), WorkerError> {
        let mut stats = BatchStats::default();
        let mut pool: JoinSet<UploadTaskResult> = JoinSet::new();
        let permits = Arc::new(Semaphore::new(self.options.parallel_uploads.clamp(1, 10)));
        let mut max_taken_key = self.progress.last_processed_shard_key;
        let mut min_transient_key: Option<i64> = None;
        let mut pending_keys: BTreeSet<i64> = BTreeSet::new();
        let mut stop = false;

        for record in batch {
            if *shutdown.borrow() {
                stop = true;
                break;
            }
            if self.limit_reached() {
                stop = true;
                break;
            }

            self.records_taken += 1;
            stats.records += 1;
            max_taken_key = max_taken_key.max(record.shard_key);

            // Cheap path-level skip: this exact file was resolved by this
            // worker in an earlier run.
            if self.cache.seen_path(&record.path) {
                stats.skipped_local += 1;
                self.progress.touch_activity(ActivityKind::Other);
                continue;
            }

            let fp = match fingerprint_file(&record.path).await {
                Ok(fp) => fp,
                Err(err) => {
                    warn!(path = %record.path.display(), error = %err, "unreadable source file");
                    self.append_error(&record.path, &err.to_string()).await;
                    stats.permanent_failures += 1;
                    continue;
                }
            };

            if let Some(layer) = self.cache.seen(&fp) {
                debug!(fingerprint = %fp, ?layer, "duplicate suppressed before upload");
                self.progress
                    .record_completed(&fp, &record.path, CompletedStatus::AlreadyPresentLocal);
                self.cache.note_resolved(fp, &record.path);
                self.progress.touch_activity(ActivityKind::Other);
                stats.already_present += 1;
                send_event(
                    events,
                    WorkerEvent::RecordFinished {
                        shard_key: record.shard_key,
                        new_uploaded: false,
                    },
                )
                .await?;
                self.note_processed_and_refresh(events).await?;
                continue;
            }

            let mut meta = self.extractor.extract_or_fallback(&record.path).await;
            if let Some(prefetched) = &record.prefetched {
                meta.merge_missing_from(&prefetched_meta(prefetched));
            }

            let source = if self.options.use_symlinks {
                UploadSource::PathRef(record.path.clone())
            } else {
                UploadSource::Bytes(record.path.clone())
            };
            let job = UploadJob {
                fingerprint: fp.clone(),
                meta,
                source,
            };

            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|_| WorkerError::ChannelClosed)?;
            let uploader = self.uploader.clone();
            let shard_key = record.shard_key;
            let path = record.path.clone();
            pending_keys.insert(shard_key);
            pool.spawn(async move {
                let (outcome, timing) = uploader.upload(&job).await;
                drop(permit);
                (shard_key, job.fingerprint, path, outcome, timing)
            });

            // Absorb any uploads that finished while we were preparing.
            while let Some(done) = pool.try_join_next() {
                if let Ok(result) = done {
                    pending_keys.remove(&result.0);
                    self.absorb_outcome(result, &mut stats, &mut min_transient_key, events)
                        .await?;
                }
            }
            self.store.commit_throttled(&mut self.progress).await?;
        }

        // Drain the pool; once shutdown is requested the drain is bounded.
        let drain_deadline = self.options.drain_deadline;
        let shard_id = self.options.shard_id;
        let drain = async {
            while let Some(done) = pool.join_next().await {
                if let Ok(result) = done {
                    pending_keys.remove(&result.0);
                    self.absorb_outcome(result, &mut stats, &mut min_transient_key, events)
                        .await?;
                }
            }
            Ok::<(), WorkerError>(())
        };
        if stop {
            let drained = tokio::time::timeout(drain_deadline, drain).await;
            match drained {
                Ok(drained) => drained?,
                Err(_) => warn!(
                    shard_id,
                    abandoned = pending_keys.len(),
                    "drain deadline expired; abandoning in-flight uploads"
                ),
            }
        } else {
            drain.await?;
        }

        // Abandoned uploads are indistinguishable from transient failures:
        // the checkpoint must not advance past them.
        for key in &pending_keys {
            stats.transient_failures += 1;
            min_transient_key = Some(min_transient_key.map_or(*key, |m| m.min(*key)));
        }

        let advance_to = compute_advance(
            self.progress.last_processed_shard_key,
            max_taken_key,
            min_transient_key,
        );
        Ok((stats, advance_to, min_transient_key, stop))
    }

    async fn absorb_outcome(
        &mut self,
        (shard_key, fp, path, outcome, timing): UploadTaskResult,
        stats: &mut BatchStats,
        min_transient_key: &mut Option<i64>,
        events: &EventSender,
    ) -> Result<(), WorkerError> {
        match &outcome {
            UploadOutcome::NewUploaded => {
                self.progress
                    .record_completed(&fp, &path, CompletedStatus::Uploaded);
                self.cache.note_uploaded(fp);
                self.progress.touch_activity(ActivityKind::Upload);
                stats.new_uploaded += 1;
                self.new_uploads_total += 1;
                if timing.is_slow() {
                    send_event(
                        events,
                        WorkerEvent::SlowUpload {
                            shard_key,
                            elapsed: timing.elapsed,
                        },
                    )
                    .await?;
                }
                if self.new_uploads_total % RATE_SAMPLE_EVERY == 0 {
                    let minutes = self.started_at.elapsed().as_secs_f64() / 60.0;
                    if minutes > 0.0 {
                        send_event(
                            events,
                            WorkerEvent::UploadRate {
                                uploads_per_minute: self.new_uploads_total as f64 / minutes,
                            },
                        )
                        .await?;
                    }
                }
            }
            UploadOutcome::AlreadyPresent => {
                self.progress
                    .record_completed(&fp, &path, CompletedStatus::AlreadyPresentRemote);
                self.cache.note_resolved(fp, &path);
                self.progress.touch_activity(ActivityKind::Other);
                stats.already_present += 1;
            }
            UploadOutcome::PermanentFailure(reason) => {
                warn!(path = %path.display(), reason = %reason, "permanent upload failure");
                self.progress
                    .record_completed(&fp, &path, CompletedStatus::Unresolvable);
                self.cache.note_resolved(fp, &path);
                self.append_error(&path, reason).await;
                stats.permanent_failures += 1;
            }
            UploadOutcome::TransientFailure(reason) => {
                warn!(path = %path.display(), reason = %reason, "transient failure; record will retry next batch");
                stats.transient_failures += 1;
                *min_transient_key = Some(min_transient_key.map_or(shard_key, |m| m.min(shard_key)));
            }
        }

        send_event(
            events,
            WorkerEvent::RecordFinished {
                shard_key,
                new_uploaded: matches!(outcome, UploadOutcome::NewUploaded),
            },
        )
        .await?;
        self.note_processed_and_refresh(events).await
    }

    async fn note_processed_and_refresh(&mut self, events: &EventSender) -> Result<(), WorkerError> {
        if !self.cache.note_processed() {
            return Ok(());
        }
        match self.target.all_fingerprints().await {
            Ok(mirror) => {
                let size = mirror.len();
                self.cache.apply_mirror(mirror);
                send_event(events, WorkerEvent::MirrorRefreshed { size }).await?;
            }
            Err(err) => {
                warn!(error = %err, "remote mirror refresh failed; keeping stale mirror");
                self.cache.defer_refresh();
            }
        }
        Ok(())
    }

    async fn append_error(&self, path: &std::path::Path, reason: &str) {
        use tokio::io::AsyncWriteExt;
        let error_file = self.paths.worker_error_file(self.options.shard_id);
        let line = format!("{}: {}\n", path.display(), reason);
        let result = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&error_file)
            .await;
        if let Ok(mut file) = result {
            let _ = file.write_all(line.as_bytes()).await;
        }
    }
}

fn prefetched_meta(prefetched: &crate::catalog::PrefetchedMeta) -> BookMeta {
    BookMeta {
        title: prefetched.title.clone().unwrap_or_default(),
        authors: prefetched.authors.clone(),
        language: prefetched.language.clone(),
        series: prefetched.series.clone(),
        series_index: prefetched.series_index,
    }
}

/// The checkpoint advances to the batch's max key only when every taken
/// record terminated; a transient failure pins it just below the first
/// unterminated key so a restart retries from there.
fn compute_advance(current: i64, max_taken_key: i64, min_transient_key: Option<i64>) -> i64 {
    let advance = match min_transient_key {
        Some(key) => key - 1,
        None => max_taken_key,
    };
    advance.max(current)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_reaches_batch_max_without_transients() {
        assert_eq!(compute_advance(10, 40, None), 40);
    }

    #[test]
    fn advance_stops_before_first_transient() {
        assert_eq!(compute_advance(10, 40, Some(25)), 24);
    }

    #[test]
    fn advance_never_regresses() {
        assert_eq!(compute_advance(30, 40, Some(12)), 30);
        assert_eq!(compute_advance(50, 40, None), 50);
    }
}
