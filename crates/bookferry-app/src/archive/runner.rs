use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_stream::try_stream;
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use futures::StreamExt;
use futures_util::stream::Stream;
use sysinfo::System;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::staging::{
    check_free_space, extract_archive, find_reusable_extraction, list_extracted_files,
};
use super::types::{ArchiveEvent, ArchiveOptions, ArchiveRunSummary, ArchiveWorkerError};
use crate::dedup::DedupCache;
use crate::fingerprint::{FileFormat, Fingerprint, detect_format, fingerprint_file};
use crate::metadata::MetadataExtractor;
use crate::paths::RunPaths;
use crate::progress::{
    ActivityKind, ArchiveSummary, CompletedStatus, ProgressStore, WorkerProgress, WorkerStatus,
};
use crate::remote::{TargetClient, UploadSource};
use crate::uploader::{UploadJob, UploadOutcome, UploadTiming, Uploader};
use crate::worker::collect_peer_fingerprints;

enum EventMessage {
    Event(ArchiveEvent),
    Error(ArchiveWorkerError),
}

type EventSender = mpsc::Sender<EventMessage>;

async fn send_event(sender: &EventSender, event: ArchiveEvent) -> Result<(), ArchiveWorkerError> {
    sender
        .send(EventMessage::Event(event))
        .await
        .map_err(|_| ArchiveWorkerError::ChannelClosed)
}

/// Deterministic assignment of a sorted archive list across the fleet.
pub fn assign_round_robin(archives: &[PathBuf], shard_id: u32, shard_count: u32) -> Vec<PathBuf> {
    debug_assert!(shard_count > 0);
    let mut sorted: Vec<&PathBuf> = archives.iter().collect();
    sorted.sort();
    sorted
        .into_iter()
        .enumerate()
        .filter(|(index, _)| (*index as u32) % shard_count == shard_id)
        .map(|(_, path)| path.clone())
        .collect()
}

/// Whether any live process looks like the archive worker for `shard_id`.
fn peer_process_alive(sys: &System, shard_id: u32) -> bool {
    let marker = format!("--shard-id {shard_id}");
    let alt_marker = format!("--shard-id={shard_id}");
    sys.processes().values().any(|process| {
        let cmdline = process
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        cmdline.contains("bookferry") && (cmdline.contains(&marker) || cmdline.contains(&alt_marker))
    })
}

/// Archive worker: same pipeline as the shard worker, fed from assigned tar
/// bundles, with extraction-folder reuse and orphan recovery.
pub struct ArchiveWorker {
    target: Arc<dyn TargetClient>,
    uploader: Uploader,
    extractor: MetadataExtractor,
    paths: RunPaths,
    options: ArchiveOptions,
}

impl ArchiveWorker {
    pub fn new(
        target: Arc<dyn TargetClient>,
        uploader: Uploader,
        extractor: MetadataExtractor,
        paths: RunPaths,
        options: ArchiveOptions,
    ) -> Self {
        Self {
            target,
            uploader,
            extractor,
            paths,
            options,
        }
    }

    pub fn run_stream(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> impl Stream<Item = Result<ArchiveEvent, ArchiveWorkerError>> {
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
                        let done = matches!(event, ArchiveEvent::Completed { .. });
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
    ) -> Result<(), ArchiveWorkerError> {
        let options = self.options.clone();
        let mut store = ProgressStore::new(self.paths.progress_file(options.shard_id));
        let mut progress = store
            .load(options.shard_id, options.shard_count)
            .await
            .unwrap_or_else(|| WorkerProgress::empty(options.shard_id, options.shard_count));

        // Merge the CLI assignment into the durable one so the supervisor and
        // peers see a stable claim.
        let mut assigned: Vec<String> = progress.assigned_archives.clone();
        for archive in &options.archives {
            let rendered = archive.display().to_string();
            if !assigned.contains(&rendered) {
                assigned.push(rendered);
            }
        }
        progress.assigned_archives = assigned;
        progress.status = WorkerStatus::Initializing;
        progress.touch_activity(ActivityKind::Other);
        store.commit(&mut progress).await?;

        let mut cache = DedupCache::new(options.refresh_policy);
        cache.seed_local(&progress);
        cache.reload_peers(collect_peer_fingerprints(&self.paths, options.shard_id).await);

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
            .map_err(ArchiveWorkerError::MirrorBootstrap)?;
        let mirror_size = mirror.len();
        cache.apply_mirror(mirror);

        let mut queue: VecDeque<PathBuf> = progress
            .assigned_archives
            .iter()
            .map(PathBuf::from)
            .filter(|path| !is_completed(&progress, path))
            .collect();

        send_event(
            &events,
            ArchiveEvent::Initialized {
                assigned: queue.len(),
                mirror_size,
            },
        )
        .await?;

        let mut run = ArchiveRun {
            target: self.target,
            uploader: self.uploader,
            extractor: self.extractor,
            paths: self.paths,
            options,
            store,
            progress,
            cache,
            summary: ArchiveRunSummary::default(),
        };

        loop {
            let Some(archive) = queue.pop_front() else {
                // Claims are recorded in our own assignment before
                // processing, so repeated scans converge.
                if run.options.orphan_recovery {
                    let claimed = run.claim_orphans(&events).await?;
                    if !claimed.is_empty() {
                        queue.extend(claimed);
                        continue;
                    }
                }
                break;
            };

            if run.paths.pause_flag(run.options.shard_id).exists() {
                run.progress.status = WorkerStatus::Paused;
                run.store.commit(&mut run.progress).await?;
                send_event(&events, ArchiveEvent::Paused).await?;
                break;
            }
            if *shutdown.borrow() {
                send_event(
                    &events,
                    ArchiveEvent::Draining {
                        reason: "shutdown requested".to_string(),
                    },
                )
                .await?;
                break;
            }

            run.process_archive(&archive, &events, &shutdown).await?;
        }

        run.store.commit(&mut run.progress).await?;
        let summary = run.summary;
        send_event(&events, ArchiveEvent::Completed { summary }).await?;
        Ok(())
    }
}

fn is_completed(progress: &WorkerProgress, archive: &Path) -> bool {
    archive
        .file_name()
        .map(|name| {
            progress
                .completed_archives
                .contains(&name.to_string_lossy().into_owned())
        })
        .unwrap_or(false)
}

struct ArchiveRun {
    target: Arc<dyn TargetClient>,
    uploader: Uploader,
    extractor: MetadataExtractor,
    paths: RunPaths,
    options: ArchiveOptions,
    store: ProgressStore,
    progress: WorkerProgress,
    cache: DedupCache,
    summary: ArchiveRunSummary,
}

impl ArchiveRun {
    async fn process_archive(
        &mut self,
        archive: &Path,
        events: &EventSender,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), ArchiveWorkerError> {
        let name = archive
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| archive.display().to_string());
        let base = archive
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());

        let mut archive_summary = ArchiveSummary {
            started_at: Some(Utc::now()),
            ..ArchiveSummary::default()
        };
        self.progress.current_archive = Some(name.clone());
        self.progress.status = WorkerStatus::Processing;
        self.progress.touch_activity(ActivityKind::Other);
        self.store.commit(&mut self.progress).await?;

        let extraction = match find_reusable_extraction(&self.options.staging_dir, &base) {
            Some(dir) => dir,
            None => {
                check_free_space(&self.options.staging_dir, self.options.min_free_bytes)?;
                info!(archive = %archive.display(), "extracting archive");
                extract_archive(archive, &self.options.staging_dir, &base).await?
            }
        };
        if extraction.reused {
            self.summary.archives_reused += 1;
        }
        send_event(
            events,
            ArchiveEvent::ArchiveStarted {
                name: name.clone(),
                reused_extraction: extraction.reused,
            },
        )
        .await?;

        let files: Vec<PathBuf> = list_extracted_files(&extraction.path)
            .into_iter()
            .filter(|path| detect_format(path) != FileFormat::Unknown)
            .collect();
        send_event(
            events,
            ArchiveEvent::ExtractionCompleted {
                name: name.clone(),
                files: files.len(),
            },
        )
        .await?;

        self.process_files(&name, files, &mut archive_summary, events, shutdown)
            .await?;

        let interrupted = *shutdown.borrow();
        let completed = !interrupted && archive_summary.transient_errors == 0;
        if completed {
            archive_summary.completed_at = Some(Utc::now());
            self.progress
                .completed_archives
                .insert(name.clone());
            self.progress.current_archive = None;
            self.summary.archives_completed += 1;
        }
        self.progress
            .archive_progress
            .insert(name.clone(), archive_summary.clone());
        self.store.commit(&mut self.progress).await?;

        if completed {
            if extraction.reused {
                debug!(path = %extraction.path.display(), "keeping reused extraction folder");
            } else if let Err(err) = tokio::fs::remove_dir_all(&extraction.path).await {
                warn!(path = %extraction.path.display(), error = %err, "failed to remove extraction folder");
            }
            send_event(
                events,
                ArchiveEvent::ArchiveCompleted {
                    name,
                    summary: archive_summary,
                },
            )
            .await?;
        } else if !interrupted {
            // The archive stays off the completed set and the extraction
            // folder stays on disk; the next pass finds the folder through
            // the reuse scan and retries only the unresolved files.
            warn!(
                archive = %name,
                transient = archive_summary.transient_errors,
                "archive left incomplete; transient failures will retry on the next pass"
            );
        }
        Ok(())
    }

    /// Stream extracted files through parallel fingerprinting, the serialized
    /// dedup filter, and the bounded upload pool.
    async fn process_files(
        &mut self,
        name: &str,
        files: Vec<PathBuf>,
        archive_summary: &mut ArchiveSummary,
        events: &EventSender,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<(), ArchiveWorkerError> {
        let fingerprint_parallelism = self.options.fingerprint_parallelism.max(1);
        let mut fingerprints = futures::stream::iter(files.into_iter().map(|path| async move {
            let fp = fingerprint_file(&path).await;
            (path, fp)
        }))
        .buffer_unordered(fingerprint_parallelism);

        let mut pool: JoinSet<(Fingerprint, PathBuf, UploadOutcome, UploadTiming)> = JoinSet::new();
        let permits = Arc::new(Semaphore::new(self.options.parallel_uploads.clamp(1, 10)));
        let mut interrupted = false;

        while let Some((path, fp)) = fingerprints.next().await {
            if *shutdown.borrow() {
                interrupted = true;
                break;
            }

            archive_summary.files_processed += 1;
            self.summary.files_processed += 1;

            let fp = match fp {
                Ok(fp) => fp,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "unreadable extracted file");
                    archive_summary.errors += 1;
                    self.summary.errors += 1;
                    continue;
                }
            };

            if self.cache.seen(&fp).is_some() {
                self.progress
                    .record_completed(&fp, &path, CompletedStatus::AlreadyPresentLocal);
                self.cache.note_resolved(fp, &path);
                self.progress.touch_activity(ActivityKind::Other);
                self.summary.already_present += 1;
                send_event(
                    events,
                    ArchiveEvent::RecordFinished {
                        name: name.to_string(),
                        new_uploaded: false,
                    },
                )
                .await?;
                self.note_processed_and_refresh(events).await?;
                continue;
            }

            let meta = self.extractor.extract_or_fallback(&path).await;
            let job = UploadJob {
                fingerprint: fp.clone(),
                meta,
                // Extracted files live in scratch space the service cannot
                // link against, so archive mode always ships bytes.
                source: UploadSource::Bytes(path.clone()),
            };

            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|_| ArchiveWorkerError::ChannelClosed)?;
            let uploader = self.uploader.clone();
            pool.spawn(async move {
                let (outcome, timing) = uploader.upload(&job).await;
                drop(permit);
                (job.fingerprint, path, outcome, timing)
            });

            while let Some(done) = pool.try_join_next() {
                if let Ok(result) = done {
                    self.absorb_outcome(name, result, archive_summary, events)
                        .await?;
                }
            }
            self.store.commit_throttled(&mut self.progress).await?;
        }

        let drain_deadline = self.options.drain_deadline;
        let shard_id = self.options.shard_id;
        let drain = async {
            while let Some(done) = pool.join_next().await {
                if let Ok(result) = done {
                    self.absorb_outcome(name, result, archive_summary, events)
                        .await?;
                }
            }
            Ok::<(), ArchiveWorkerError>(())
        };
        if interrupted {
            let drained = tokio::time::timeout(drain_deadline, drain).await;
            match drained {
                Ok(drained) => drained?,
                Err(_) => warn!(
                    shard_id,
                    "drain deadline expired; abandoning in-flight uploads"
                ),
            }
        } else {
            drain.await?;
        }
        Ok(())
    }

    async fn absorb_outcome(
        &mut self,
        name: &str,
        (fp, path, outcome, _timing): (Fingerprint, PathBuf, UploadOutcome, UploadTiming),
        archive_summary: &mut ArchiveSummary,
        events: &EventSender,
    ) -> Result<(), ArchiveWorkerError> {
        match &outcome {
            UploadOutcome::NewUploaded => {
                self.progress
                    .record_completed(&fp, &path, CompletedStatus::Uploaded);
                self.cache.note_uploaded(fp);
                self.progress.touch_activity(ActivityKind::Upload);
                archive_summary.files_uploaded += 1;
                self.summary.files_uploaded += 1;
            }
            UploadOutcome::AlreadyPresent => {
                self.progress
                    .record_completed(&fp, &path, CompletedStatus::AlreadyPresentRemote);
                self.cache.note_resolved(fp, &path);
                self.progress.touch_activity(ActivityKind::Other);
                self.summary.already_present += 1;
            }
            UploadOutcome::PermanentFailure(reason) => {
                warn!(path = %path.display(), reason = %reason, "permanent upload failure");
                self.progress
                    .record_completed(&fp, &path, CompletedStatus::Unresolvable);
                self.cache.note_resolved(fp, &path);
                archive_summary.errors += 1;
                self.summary.errors += 1;
            }
            UploadOutcome::TransientFailure(reason) => {
                // A nonzero transient count keeps the archive off the
                // completed set and its extraction folder on disk, so these
                // files are retried on the next pass.
                warn!(path = %path.display(), reason = %reason, "transient upload failure in archive");
                archive_summary.errors += 1;
                archive_summary.transient_errors += 1;
                self.summary.errors += 1;
            }
        }

        send_event(
            events,
            ArchiveEvent::RecordFinished {
                name: name.to_string(),
                new_uploaded: matches!(outcome, UploadOutcome::NewUploaded),
            },
        )
        .await?;
        self.note_processed_and_refresh(events).await
    }

    async fn note_processed_and_refresh(
        &mut self,
        events: &EventSender,
    ) -> Result<(), ArchiveWorkerError> {
        if !self.cache.note_processed() {
            return Ok(());
        }
        match self.target.all_fingerprints().await {
            Ok(mirror) => {
                let size = mirror.len();
                self.cache.apply_mirror(mirror);
                send_event(events, ArchiveEvent::MirrorRefreshed { size }).await?;
            }
            Err(err) => {
                warn!(error = %err, "remote mirror refresh failed; keeping stale mirror");
                self.cache.defer_refresh();
            }
        }
        Ok(())
    }

    /// Scan peer progress for archives stranded by dead workers. Uploads are
    /// idempotent via fingerprints, so claiming needs no coordination beyond
    /// skipping archives a live peer still owns.
    async fn claim_orphans(
        &mut self,
        events: &EventSender,
    ) -> Result<Vec<PathBuf>, ArchiveWorkerError> {
        let sys = System::new_all();
        let mut live_assigned: HashSet<String> = HashSet::new();
        let mut dead_peers: Vec<(u32, WorkerProgress)> = Vec::new();

        for (shard_id, path) in self.paths.list_progress_files() {
            if shard_id == self.options.shard_id {
                continue;
            }
            let Some(peer) = crate::progress::load_progress_file(&path).await else {
                continue;
            };
            if peer_process_alive(&sys, shard_id) {
                live_assigned.extend(peer.assigned_archives.iter().cloned());
            } else {
                dead_peers.push((shard_id, peer));
            }
        }

        let own_claimed: HashSet<String> =
            self.progress.assigned_archives.iter().cloned().collect();
        let mut claimed = Vec::new();

        for (shard_id, peer) in dead_peers {
            for rendered in &peer.assigned_archives {
                let path = PathBuf::from(rendered);
                if is_completed(&peer, &path) || is_completed(&self.progress, &path) {
                    continue;
                }
                if live_assigned.contains(rendered) || own_claimed.contains(rendered) {
                    continue;
                }
                if !path.is_file() {
                    continue;
                }
                info!(archive = %rendered, from_shard = shard_id, "claiming orphaned archive");
                self.progress.assigned_archives.push(rendered.clone());
                self.summary.orphans_claimed += 1;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| rendered.clone());
                send_event(
                    events,
                    ArchiveEvent::OrphanClaimed {
                        name,
                        from_shard: shard_id,
                    },
                )
                .await?;
                claimed.push(path);
            }
        }

        if !claimed.is_empty() {
            self.store.commit(&mut self.progress).await?;
        }
        Ok(claimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_assignment_partitions_sorted_list() {
        let archives: Vec<PathBuf> = ["c.tar", "a.tar", "b.tar", "d.tar"]
            .iter()
            .map(PathBuf::from)
            .collect();

        let shard0 = assign_round_robin(&archives, 0, 2);
        let shard1 = assign_round_robin(&archives, 1, 2);
        assert_eq!(shard0, vec![PathBuf::from("a.tar"), PathBuf::from("c.tar")]);
        assert_eq!(shard1, vec![PathBuf::from("b.tar"), PathBuf::from("d.tar")]);
    }

    #[test]
    fn completed_lookup_uses_file_name() {
        let mut progress = WorkerProgress::empty(0, 1);
        progress
            .completed_archives
            .insert("bundle-01.tar".to_string());
        assert!(is_completed(&progress, Path::new("/tars/bundle-01.tar")));
        assert!(!is_completed(&progress, Path::new("/tars/bundle-02.tar")));
    }
}
