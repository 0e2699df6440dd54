//! Supervisor loop behavior against a temp run directory: stopped-worker
//! restarts, verification records, and escalation to the pause flag.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use bookferry_app::paths::RunPaths;
use bookferry_app::progress::{ProgressStore, WorkerProgress};
use bookferry_monitor::fixes::FixExecutor;
use bookferry_monitor::history::{FixAttempt, FixHistory, FixOutcome, FixType};
use bookferry_monitor::probe::StuckThresholds;
use bookferry_monitor::supervisor::{Supervisor, SupervisorSettings};

/// Restart script that records each invocation as `restarted-<shard>`.
fn install_restart_script(dir: &Path) -> std::path::PathBuf {
    let script = dir.join("restart-worker.sh");
    std::fs::write(
        &script,
        format!("#!/bin/sh\ntouch {}/restarted-$1\nexit 0\n", dir.display()),
    )
    .expect("script");
    let mut perms = std::fs::metadata(&script).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).expect("chmod");
    script
}

async fn seed_stopped_worker(paths: &RunPaths, shard_id: u32) {
    let mut progress = WorkerProgress::empty(shard_id, 4);
    progress.last_processed_shard_key = 1_234;
    let mut store = ProgressStore::new(paths.progress_file(shard_id));
    store.commit(&mut progress).await.expect("seed progress");
}

fn settings() -> SupervisorSettings {
    SupervisorSettings {
        thresholds: StuckThresholds::default(),
        verify_after: Duration::ZERO,
        fix_cooldown: Duration::from_secs(3_600),
        disk_device: Some("no-such-device".to_string()),
        disk_sample: Duration::from_millis(10),
        ..SupervisorSettings::default()
    }
}

fn executor(temp: &TempDir, dry_run: bool) -> FixExecutor {
    FixExecutor::new(
        install_restart_script(temp.path()),
        temp.path().join("backups"),
        None,
        Vec::new(),
        false,
        dry_run,
    )
}

#[tokio::test]
async fn stopped_worker_is_restarted_and_verified() {
    let temp = TempDir::new().expect("temp");
    let paths = RunPaths::new(temp.path()).expect("paths");
    seed_stopped_worker(&paths, 0).await;

    let mut supervisor = Supervisor::new(
        RunPaths::new(temp.path()).expect("paths"),
        settings(),
        executor(&temp, false),
        None,
    );

    supervisor.tick().await.expect("tick one");
    assert!(
        temp.path().join("restarted-0").exists(),
        "restart script was not invoked"
    );

    // The verification window has elapsed (zero) by the next tick; a worker
    // that is no longer stuck counts as recovered.
    supervisor.tick().await.expect("tick two");
    let history = FixHistory::open(paths.fix_history_file());
    assert_eq!(history.entries().len(), 1);
    assert_eq!(history.entries()[0].outcome, FixOutcome::VerifiedOk);
    assert_eq!(history.entries()[0].worker_id, 0);
    assert_eq!(history.entries()[0].attempt_index, 1);
}

#[tokio::test]
async fn exhausted_attempts_escalate_to_pause_flag() {
    let temp = TempDir::new().expect("temp");
    let paths = RunPaths::new(temp.path()).expect("paths");
    seed_stopped_worker(&paths, 2).await;

    // Three recent failed fixes already on record.
    let mut history = FixHistory::open(paths.fix_history_file());
    for attempt_index in 1..=3 {
        history
            .record(FixAttempt {
                worker_id: 2,
                ts: Utc::now(),
                root_cause: "worker process stopped".to_string(),
                fix_type: FixType::Restart,
                params: None,
                diff: None,
                outcome: FixOutcome::NotRecovered,
                attempt_index,
            })
            .expect("seed history");
    }
    drop(history);

    let mut config = settings();
    config.fix_cooldown = Duration::ZERO;
    let mut supervisor = Supervisor::new(
        RunPaths::new(temp.path()).expect("paths"),
        config,
        executor(&temp, false),
        None,
    );

    supervisor.tick().await.expect("tick");
    assert!(paths.pause_flag(2).exists(), "worker was not paused");
    assert!(
        !temp.path().join("restarted-2").exists(),
        "paused worker must not be restarted"
    );
}

#[tokio::test]
async fn dry_run_applies_nothing() {
    let temp = TempDir::new().expect("temp");
    let paths = RunPaths::new(temp.path()).expect("paths");
    seed_stopped_worker(&paths, 1).await;

    let mut supervisor = Supervisor::new(
        RunPaths::new(temp.path()).expect("paths"),
        settings(),
        executor(&temp, true),
        None,
    );

    supervisor.tick().await.expect("tick");
    assert!(!temp.path().join("restarted-1").exists());
}

#[tokio::test]
async fn paused_workers_are_left_alone() {
    let temp = TempDir::new().expect("temp");
    let paths = RunPaths::new(temp.path()).expect("paths");
    seed_stopped_worker(&paths, 3).await;
    std::fs::write(paths.pause_flag(3), "operator hold\n").expect("flag");

    let mut supervisor = Supervisor::new(
        RunPaths::new(temp.path()).expect("paths"),
        settings(),
        executor(&temp, false),
        None,
    );

    supervisor.tick().await.expect("tick");
    assert!(!temp.path().join("restarted-3").exists());
}
