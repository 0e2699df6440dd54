//! Worker liveness and stuck detection.
//!
//! The supervisor never talks to a worker directly: everything it knows
//! comes from the process table, the worker's progress file, and its log
//! tail. Three rules decide stuckness (spec'd thresholds, overridable):
//! a worker that has uploaded goes stale by upload age; one that never
//! uploaded while initializing or discovering gets a longer grace period
//! gated on log progress signals; everything else goes stale by activity
//! age.

use std::collections::HashSet;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use sysinfo::System;
use tracing::debug;

use bookferry_app::paths::RunPaths;
use bookferry_app::progress::{WorkerProgress, WorkerStatus, load_progress_file};

/// Stuck-detection thresholds.
#[derive(Debug, Clone, Copy)]
pub struct StuckThresholds {
    /// Max age of the last upload for a worker that has uploaded.
    pub upload_stale: Duration,
    /// Grace period for a worker that has not uploaded yet.
    pub startup_grace: Duration,
    /// Max age of the last log progress signal during startup grace.
    pub signal_stale: Duration,
}

impl Default for StuckThresholds {
    fn default() -> Self {
        Self {
            upload_stale: Duration::from_secs(5 * 60),
            startup_grace: Duration::from_secs(10 * 60),
            signal_stale: Duration::from_secs(20 * 60),
        }
    }
}

/// One worker as seen from outside.
#[derive(Debug)]
pub struct WorkerView {
    pub shard_id: u32,
    pub pid: Option<u32>,
    pub process_uptime: Option<Duration>,
    pub progress: Option<WorkerProgress>,
    pub log_path: PathBuf,
}

impl WorkerView {
    pub fn is_alive(&self) -> bool {
        self.pid.is_some()
    }
}

/// Diagnostic bundle for one stuck worker.
#[derive(Debug, Clone)]
pub struct StuckDiagnosis {
    pub shard_id: u32,
    pub minutes_stuck: u64,
    pub status: Option<WorkerStatus>,
    pub last_upload_at: Option<DateTime<Utc>>,
    pub key_range: String,
    pub error_patterns: Vec<String>,
    pub log_excerpt: String,
}

/// Snapshot every known worker: progress files joined with the process
/// table.
pub async fn survey_workers(paths: &RunPaths, sys: &System) -> Vec<WorkerView> {
    let mut views = Vec::new();

    for (shard_id, progress_path) in paths.list_progress_files() {
        let progress = load_progress_file(&progress_path).await;
        let (pid, uptime) = find_worker_process(sys, shard_id)
            .map(|(pid, uptime)| (Some(pid), Some(uptime)))
            .unwrap_or((None, None));
        views.push(WorkerView {
            shard_id,
            pid,
            process_uptime: uptime,
            progress,
            log_path: paths.worker_log_file(shard_id),
        });
    }

    views
}

/// Locate the worker process for a shard by command line.
pub fn find_worker_process(sys: &System, shard_id: u32) -> Option<(u32, Duration)> {
    let marker = format!("--shard-id {shard_id}");
    let alt_marker = format!("--shard-id={shard_id}");
    for (pid, process) in sys.processes() {
        let cmdline = process
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if !cmdline.contains("bookferry") {
            continue;
        }
        if !cmdline.contains(" migrate ") && !cmdline.contains(" tars ") {
            continue;
        }
        if cmdline.contains(&marker) || cmdline.contains(&alt_marker) {
            let uptime = Duration::from_secs(
                Utc::now()
                    .timestamp()
                    .saturating_sub(process.start_time() as i64)
                    .max(0) as u64,
            );
            return Some((pid.as_u32(), uptime));
        }
    }
    None
}

/// Apply the stuck rules to one live worker. `None` means healthy.
pub fn assess_stuck(
    view: &WorkerView,
    thresholds: &StuckThresholds,
    now: DateTime<Utc>,
) -> Option<StuckDiagnosis> {
    let progress = view.progress.as_ref()?;
    let tail = read_log_tail(&view.log_path, 500);

    let minutes_stuck = if let Some(uploaded_at) = progress.last_uploaded_at {
        let since = age(now, uploaded_at);
        if since < thresholds.upload_stale {
            return None;
        }
        since.as_secs() / 60
    } else if matches!(
        progress.status,
        WorkerStatus::Initializing | WorkerStatus::Discovering
    ) {
        // Never uploaded: allow a slow start, but only while the log still
        // shows forward motion.
        let uptime = view.process_uptime?;
        if uptime < thresholds.startup_grace {
            return None;
        }
        let last_signal = last_progress_signal(&tail);
        if let Some(signal_at) = last_signal {
            if age(now, signal_at) < thresholds.signal_stale {
                debug!(shard_id = view.shard_id, "startup is slow but still progressing");
                return None;
            }
        }
        uptime.as_secs() / 60
    } else {
        let activity_at = progress.last_activity_at?;
        let since = age(now, activity_at);
        if since < thresholds.upload_stale {
            return None;
        }
        since.as_secs() / 60
    };

    Some(StuckDiagnosis {
        shard_id: view.shard_id,
        minutes_stuck,
        status: Some(progress.status),
        last_upload_at: progress.last_uploaded_at,
        key_range: extract_key_range(&tail)
            .unwrap_or_else(|| format!("key > {}", progress.last_processed_shard_key)),
        error_patterns: extract_error_patterns(&tail),
        log_excerpt: tail,
    })
}

fn age(now: DateTime<Utc>, then: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// Last `lines` lines of a log file, reading only the tail of the file.
pub fn read_log_tail(path: &Path, lines: usize) -> String {
    const TAIL_BYTES: u64 = 128 * 1024;

    let Ok(mut file) = std::fs::File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > TAIL_BYTES {
        let _ = file.seek(SeekFrom::Start(len - TAIL_BYTES));
    }
    let mut raw = Vec::new();
    if file.read_to_end(&mut raw).is_err() {
        return String::new();
    }
    let content = String::from_utf8_lossy(&raw);
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Timestamp prefix of a tracing-formatted log line.
pub fn parse_log_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let ts_re = timestamp_regex();
    let capture = ts_re.captures(line)?;
    let parsed =
        NaiveDateTime::parse_from_str(capture.get(1)?.as_str(), "%Y-%m-%dT%H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&parsed))
}

fn timestamp_regex() -> Regex {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})").unwrap_or_else(|_| Regex::new("$^").unwrap())
}

const PROGRESS_SIGNALS: [&str; 5] = [
    "Processed batch",
    "new files",
    "fetched catalog batch",
    "extracting archive",
    "Successfully uploaded",
];

/// Most recent log line carrying a progress signal.
pub fn last_progress_signal(tail: &str) -> Option<DateTime<Utc>> {
    tail.lines()
        .filter(|line| PROGRESS_SIGNALS.iter().any(|signal| line.contains(signal)))
        .filter_map(parse_log_timestamp)
        .max()
}

/// Distinct error-shaped snippets from a log tail, bounded for the oracle
/// prompt.
pub fn extract_error_patterns(tail: &str) -> Vec<String> {
    let patterns = [
        r"ERROR[^\n]{0,120}",
        r"panicked at[^\n]{0,120}",
        r"[Cc]onnection (?:refused|reset)[^\n]{0,60}",
        r"[Tt]imed? ?out[^\n]{0,60}",
        r"status 5\d\d[^\n]{0,60}",
    ];

    let mut found = Vec::new();
    let mut seen = HashSet::new();
    for pattern in patterns {
        let Ok(re) = Regex::new(pattern) else { continue };
        for capture in re.find_iter(tail).take(5) {
            let snippet = capture.as_str().trim().to_string();
            if seen.insert(snippet.clone()) {
                found.push(snippet);
            }
        }
    }
    found
}

/// Catalog key range mentioned in the log, to spot loops over the same span.
pub fn extract_key_range(tail: &str) -> Option<String> {
    let re = Regex::new(r"after_key[ =](\d+)").ok()?;
    re.captures_iter(tail)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| format!("key > {}", m.as_str()))
}

/// Whether the log shows the worker fetching the same key range over and
/// over, the signature of a loop in catalog iteration.
pub fn key_range_repeats(tail: &str) -> bool {
    let Ok(re) = Regex::new(r"after_key[ =](\d+)") else {
        return false;
    };
    let keys: Vec<&str> = re
        .captures_iter(tail)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect();
    keys.len() >= 3 && keys[keys.len() - 3..].iter().all(|k| *k == keys[keys.len() - 1])
}
