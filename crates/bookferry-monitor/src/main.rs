use std::process;
use std::time::Duration;

use tracing_subscriber::{filter::LevelFilter, fmt};

use bookferry_app::paths::RunPaths;
use bookferry_monitor::cli::Cli;
use bookferry_monitor::config;
use bookferry_monitor::error::MonitorError;
use bookferry_monitor::fixes::FixExecutor;
use bookferry_monitor::fleet::FleetPolicy;
use bookferry_monitor::probe::StuckThresholds;
use bookferry_monitor::supervisor::{Supervisor, SupervisorSettings};
use oracle_ox::OracleClient;

const ORACLE_KEY_ENV: &str = "BOOKFERRY_ORACLE_API_KEY";

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(match cli.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    });

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    let subscriber = fmt().with_max_level(level).with_target(false).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; skipping re-initialization");
    }
}

async fn run(cli: Cli) -> Result<(), MonitorError> {
    let config = config::load()?;

    let paths = match cli.run_dir.as_ref().or(config.run_dir.as_ref()) {
        Some(dir) => RunPaths::new(dir)?,
        None => RunPaths::from_project_dirs()?,
    };

    let stuck_minutes = cli.threshold.unwrap_or(config.stuck_threshold_minutes);
    let thresholds = StuckThresholds {
        upload_stale: Duration::from_secs(stuck_minutes * 60),
        ..StuckThresholds::default()
    };

    let settings = SupervisorSettings {
        check_interval: Duration::from_secs(
            cli.check_interval.unwrap_or(config.check_interval_secs),
        ),
        thresholds,
        fleet: FleetPolicy {
            min_workers: config.fleet.min_workers,
            target_workers: config.fleet.target_workers,
            max_workers: config.fleet.max_workers,
            ..FleetPolicy::default()
        },
        shard_count: config.shard_count,
        fix_cooldown: Duration::from_secs(config.fixes.cooldown_minutes * 60),
        max_attempts: config.fixes.max_attempts,
        disk_device: cli.device.or(config.disk_device.clone()),
        snippet_source: config.fixes.worker_source_file.clone(),
        dry_run: cli.dry_run,
        ..SupervisorSettings::default()
    };

    let executor = FixExecutor::new(
        config.fixes.restart_script.clone(),
        paths.backup_dir()?,
        config.fixes.worker_source_file.clone(),
        config.fixes.validate_command.clone(),
        config.fixes.enable_code,
        cli.dry_run,
    );

    let oracle = if cli.llm_enabled {
        let api_key = config
            .oracle
            .api_key
            .clone()
            .or_else(|| std::env::var(ORACLE_KEY_ENV).ok());
        match api_key {
            Some(api_key) => Some(
                OracleClient::builder()
                    .base_url(&config.oracle.base_url)
                    .api_key(api_key)
                    .maybe_model(config.oracle.model.clone())
                    .build()?,
            ),
            None => {
                tracing::warn!(
                    "--llm-enabled but no oracle API key in config or {ORACLE_KEY_ENV}; \
                     continuing without the oracle"
                );
                None
            }
        }
    } else {
        None
    };

    let mut supervisor = Supervisor::new(paths, settings, executor, oracle);
    supervisor.run().await;
    Ok(())
}
