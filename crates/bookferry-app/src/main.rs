use std::{path::{Path, PathBuf}, pin::Pin, process, sync::Arc, time::Duration};

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::watch;
use tracing_subscriber::{Layer, filter::LevelFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use bookferry_app::archive::{
    ArchiveEvent, ArchiveOptions, ArchiveWorker, ArchiveWorkerError, assign_round_robin,
};
use bookferry_app::catalog::SqliteCatalog;
use bookferry_app::cli::{Cli, Commands, MigrateArgs, StatusArgs, TarsArgs};
use bookferry_app::config::{self, AppConfig};
use bookferry_app::dedup::RefreshPolicy;
use bookferry_app::error::AppError;
use bookferry_app::metadata::MetadataExtractor;
use bookferry_app::paths::RunPaths;
use bookferry_app::progress::load_progress_file;
use bookferry_app::remote::HttpTargetClient;
use bookferry_app::uploader::{Uploader, WatchdogConfig};
use bookferry_app::worker::{Worker, WorkerError, WorkerEvent, WorkerOptions};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    let verbosity = cli.verbose;

    match cli.command {
        Some(Commands::Migrate(args)) => run_migrate(args, verbosity).await,
        Some(Commands::Tars(args)) => run_tars(args, verbosity).await,
        Some(Commands::Status(args)) => {
            init_tracing(stderr_level(verbosity), None)?;
            run_status(args).await
        }
        None => {
            Cli::print_help();
            Ok(())
        }
    }
}

fn stderr_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Stderr gets the verbosity the operator asked for; the worker log file
/// always captures INFO because the supervisor reads it for progress signals.
fn init_tracing(stderr: LevelFilter, log_file: Option<&Path>) -> Result<(), AppError> {
    let stderr_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr);

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| AppError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_target(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(LevelFilter::INFO),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();
    Ok(())
}

/// Flip to `true` on SIGTERM or Ctrl-C; workers drain and commit.
fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        let ctrl_c = tokio::signal::ctrl_c();
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
        tracing::info!("shutdown signal received; draining");
        let _ = tx.send(true);
    });
    rx
}

fn resolve_run_paths(cli_dir: &Option<PathBuf>, config: &AppConfig) -> Result<RunPaths, AppError> {
    match cli_dir.as_ref().or(config.run_dir.as_ref()) {
        Some(dir) => Ok(RunPaths::new(dir)?),
        None => Ok(RunPaths::from_project_dirs()?),
    }
}

fn build_uploader(config: &AppConfig) -> Result<(Arc<HttpTargetClient>, Uploader), AppError> {
    let client = Arc::new(HttpTargetClient::new(
        &config.target.base_url,
        config.target.username.clone(),
        config.target.password.clone(),
    )?);
    let watchdog = WatchdogConfig {
        probe_interval: Duration::from_secs(config.watchdog.probe_secs),
        stall_after: Duration::from_secs(config.watchdog.stall_secs),
        hard_timeout: Duration::from_secs(config.watchdog.hard_secs),
    };
    let uploader = Uploader::new(client.clone(), watchdog, config.target.precheck);
    Ok((client, uploader))
}

fn refresh_policy(config: &AppConfig) -> RefreshPolicy {
    RefreshPolicy {
        after_files: config.worker.mirror_refresh_files,
        after_elapsed: Duration::from_secs(config.worker.mirror_refresh_minutes * 60),
    }
}

async fn run_migrate(args: MigrateArgs, verbosity: u8) -> Result<(), AppError> {
    if args.shard_id >= args.shard_count {
        return Err(AppError::ShardOutOfRange {
            shard_id: args.shard_id,
            shard_count: args.shard_count,
        });
    }

    let config = config::load()?;
    let paths = resolve_run_paths(&args.run_dir, &config)?;
    init_tracing(
        stderr_level(verbosity),
        Some(&paths.worker_log_file(args.shard_id)),
    )?;

    let catalog = Arc::new(SqliteCatalog::open(&args.library)?);
    let (target, uploader) = build_uploader(&config)?;
    let extractor = MetadataExtractor::new(&config.worker.metadata_tool);

    let options = WorkerOptions::builder()
        .shard_id(args.shard_id)
        .shard_count(args.shard_count)
        .batch_size(args.batch_size.unwrap_or(config.worker.batch_size))
        .parallel_uploads(args.parallel_uploads.unwrap_or(config.worker.parallel_uploads))
        .maybe_last_key_override(args.last_key)
        .maybe_limit(args.limit)
        .use_symlinks(args.use_symlinks)
        .skip_ahead_after(config.worker.skip_ahead_after)
        .skip_ahead_stride(config.worker.skip_ahead_stride)
        .refresh_policy(refresh_policy(&config))
        .build();

    tracing::info!(
        shard_id = args.shard_id,
        shard_count = args.shard_count,
        library = %args.library.display(),
        symlinks = args.use_symlinks,
        "starting migration worker"
    );

    let worker = Worker::new(catalog, target, uploader, extractor, paths, options);
    let shutdown = shutdown_signal();

    let mut stream: Pin<
        Box<dyn futures::Stream<Item = Result<WorkerEvent, WorkerError>> + Send>,
    > = Box::pin(worker.run_stream(shutdown));

    let progress = (verbosity == 0).then(make_progress_bar);
    while let Some(event) = stream.next().await {
        match event? {
            WorkerEvent::Initialized {
                resumed_key,
                mirror_size,
                total_catalog,
            } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_message(format!("resuming after key {resumed_key}"));
                }
                tracing::info!(resumed_key, mirror_size, total_catalog = ?total_catalog, "worker initialized");
            }
            WorkerEvent::BatchStarted { index, after_key, size } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_message(format!("batch {index}: {size} records after key {after_key}"));
                }
                tracing::info!(batch = index, after_key, size, "batch started");
            }
            WorkerEvent::RecordFinished { shard_key, new_uploaded } => {
                if let Some(pb) = progress.as_ref() {
                    pb.inc(1);
                }
                if new_uploaded {
                    tracing::info!(shard_key, "Successfully uploaded record");
                } else {
                    tracing::debug!(shard_key, "record already present");
                }
            }
            WorkerEvent::SlowUpload { shard_key, elapsed } => {
                tracing::warn!(shard_key, elapsed_secs = elapsed.as_secs(), "slow upload");
            }
            WorkerEvent::UploadRate { uploads_per_minute } => {
                tracing::info!(uploads_per_minute = %format!("{uploads_per_minute:.1}"), "upload rate");
            }
            WorkerEvent::BatchCompleted { index, stats, advanced_to } => {
                tracing::info!(batch = index, advanced_to, "Processed batch");
                tracing::info!(
                    "Found {} new files in batch {} ({} already present, {} failed)",
                    stats.new_uploaded,
                    index,
                    stats.already_present,
                    stats.permanent_failures + stats.transient_failures
                );
            }
            WorkerEvent::SkipAhead { from, to } => {
                tracing::info!(from, to, "skip-ahead past migrated range");
            }
            WorkerEvent::MirrorRefreshed { size } => {
                tracing::info!(size, "remote mirror refreshed");
            }
            WorkerEvent::Paused => {
                tracing::warn!("pause flag honored; worker halting");
            }
            WorkerEvent::Draining { reason } => {
                tracing::info!(reason = %reason, "worker draining");
            }
            WorkerEvent::Completed { summary } => {
                if let Some(pb) = progress.as_ref() {
                    pb.finish_with_message(format!(
                        "done: {} uploaded, {} already present, {} failed",
                        summary.new_uploaded,
                        summary.already_present,
                        summary.permanent_failures + summary.transient_failures
                    ));
                }
                tracing::info!(
                    batches = summary.batches,
                    records = summary.records,
                    new_uploaded = summary.new_uploaded,
                    already_present = summary.already_present,
                    permanent_failures = summary.permanent_failures,
                    transient_failures = summary.transient_failures,
                    last_key = summary.last_processed_shard_key,
                    "Migration complete"
                );
                break;
            }
        }
    }

    Ok(())
}

async fn run_tars(args: TarsArgs, verbosity: u8) -> Result<(), AppError> {
    if args.shard_id >= args.shard_count {
        return Err(AppError::ShardOutOfRange {
            shard_id: args.shard_id,
            shard_count: args.shard_count,
        });
    }

    let config = config::load()?;
    let paths = resolve_run_paths(&args.run_dir, &config)?;
    init_tracing(
        stderr_level(verbosity),
        Some(&paths.worker_log_file(args.shard_id)),
    )?;

    let assigned = if args.archives.is_empty() {
        let all = find_tar_files(&args.tar_dir)?;
        if all.is_empty() {
            return Err(AppError::NoArchives {
                path: args.tar_dir.clone(),
            });
        }
        assign_round_robin(&all, args.shard_id, args.shard_count)
    } else {
        args.archives.clone()
    };

    let staging_dir = match args.staging_dir.clone().or(config.staging.dir.clone()) {
        Some(dir) => {
            std::fs::create_dir_all(&dir).map_err(|source| AppError::Io {
                path: dir.clone(),
                source,
            })?;
            dir
        }
        None => paths.staging_dir()?,
    };

    let (target, uploader) = build_uploader(&config)?;
    let extractor = MetadataExtractor::new(&config.worker.metadata_tool);

    let options = ArchiveOptions::builder()
        .shard_id(args.shard_id)
        .shard_count(args.shard_count)
        .archives(assigned)
        .staging_dir(staging_dir)
        .parallel_uploads(args.parallel_uploads.unwrap_or(config.worker.parallel_uploads))
        .min_free_bytes(config.staging.min_free_gib * 1024 * 1024 * 1024)
        .orphan_recovery(!args.no_orphan_recovery)
        .refresh_policy(refresh_policy(&config))
        .build();

    tracing::info!(
        shard_id = args.shard_id,
        archives = options.archives.len(),
        "starting archive worker"
    );

    let worker = ArchiveWorker::new(target, uploader, extractor, paths, options);
    let shutdown = shutdown_signal();

    let mut stream: Pin<
        Box<dyn futures::Stream<Item = Result<ArchiveEvent, ArchiveWorkerError>> + Send>,
    > = Box::pin(worker.run_stream(shutdown));

    let progress = (verbosity == 0).then(make_progress_bar);
    while let Some(event) = stream.next().await {
        match event? {
            ArchiveEvent::Initialized { assigned, mirror_size } => {
                tracing::info!(assigned, mirror_size, "archive worker initialized");
            }
            ArchiveEvent::ArchiveStarted { name, reused_extraction } => {
                if let Some(pb) = progress.as_ref() {
                    pb.set_message(format!("processing {name}"));
                }
                tracing::info!(archive = %name, reused_extraction, "extracting archive");
            }
            ArchiveEvent::ExtractionCompleted { name, files } => {
                tracing::info!(archive = %name, files, "extraction completed");
            }
            ArchiveEvent::RecordFinished { name, new_uploaded } => {
                if let Some(pb) = progress.as_ref() {
                    pb.inc(1);
                }
                if new_uploaded {
                    tracing::info!(archive = %name, "Successfully uploaded record");
                }
            }
            ArchiveEvent::ArchiveCompleted { name, summary } => {
                tracing::info!(
                    archive = %name,
                    files_processed = summary.files_processed,
                    files_uploaded = summary.files_uploaded,
                    errors = summary.errors,
                    "Processed batch of archive files"
                );
            }
            ArchiveEvent::OrphanClaimed { name, from_shard } => {
                tracing::info!(archive = %name, from_shard, "claimed orphaned archive");
            }
            ArchiveEvent::MirrorRefreshed { size } => {
                tracing::info!(size, "remote mirror refreshed");
            }
            ArchiveEvent::Paused => {
                tracing::warn!("pause flag honored; worker halting");
            }
            ArchiveEvent::Draining { reason } => {
                tracing::info!(reason = %reason, "worker draining");
            }
            ArchiveEvent::Completed { summary } => {
                if let Some(pb) = progress.as_ref() {
                    pb.finish_with_message(format!(
                        "done: {} archives, {} uploaded, {} errors",
                        summary.archives_completed, summary.files_uploaded, summary.errors
                    ));
                }
                tracing::info!(
                    archives_completed = summary.archives_completed,
                    archives_reused = summary.archives_reused,
                    orphans_claimed = summary.orphans_claimed,
                    files_uploaded = summary.files_uploaded,
                    already_present = summary.already_present,
                    errors = summary.errors,
                    "Migration complete"
                );
                break;
            }
        }
    }

    Ok(())
}

async fn run_status(args: StatusArgs) -> Result<(), AppError> {
    let paths = match &args.run_dir {
        Some(dir) => RunPaths::new(dir)?,
        None => RunPaths::from_project_dirs()?,
    };

    let mut report = Vec::new();
    for (shard_id, path) in paths.list_progress_files() {
        if let Some(progress) = load_progress_file(&path).await {
            report.push((shard_id, progress));
        }
    }

    if args.json {
        let values: Vec<serde_json::Value> = report
            .iter()
            .map(|(shard_id, p)| {
                serde_json::json!({
                    "shard_id": shard_id,
                    "status": p.status,
                    "last_processed_shard_key": p.last_processed_shard_key,
                    "completed_files": p.completed_files.len(),
                    "completed_archives": p.completed_archives.len(),
                    "current_archive": p.current_archive,
                    "last_uploaded_at": p.last_uploaded_at,
                    "last_activity_at": p.last_activity_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    if report.is_empty() {
        println!("no progress files under {}", paths.base_dir().display());
        return Ok(());
    }

    for (shard_id, progress) in &report {
        println!(
            "worker {shard_id}: {} | key {} | {} files done | last upload {}",
            progress.status,
            progress.last_processed_shard_key,
            progress.completed_files.len(),
            progress
                .last_uploaded_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string()),
        );
        if let Some(current) = &progress.current_archive {
            println!("  current archive: {current}");
        }
        if !progress.completed_archives.is_empty() {
            println!("  archives done: {}", progress.completed_archives.len());
        }
    }

    let history_path = paths.fix_history_file();
    if history_path.exists() {
        let raw = std::fs::read_to_string(&history_path).map_err(|source| AppError::Io {
            path: history_path.clone(),
            source,
        })?;
        if let Ok(serde_json::Value::Array(entries)) = serde_json::from_str(&raw) {
            println!("supervisor fixes recorded: {}", entries.len());
        }
    }

    Ok(())
}

fn find_tar_files(dir: &Path) -> Result<Vec<PathBuf>, AppError> {
    let entries = std::fs::read_dir(dir).map_err(|source| AppError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut archives: Vec<PathBuf> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .extension()
                    .map(|ext| ext.eq_ignore_ascii_case("tar"))
                    .unwrap_or(false)
        })
        .collect();
    archives.sort();
    Ok(archives)
}

fn make_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} [{elapsed_precise}] {pos} records {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_draw_target(ProgressDrawTarget::stderr_with_hz(12));
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}
