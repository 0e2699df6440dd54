//! Supervisor configuration.
//!
//! Same layering as the worker binary: system/etc config, XDG, local file,
//! then `BOOKFERRY_MONITOR` environment variables. The oracle API key only
//! ever comes from the environment.

use std::{env, path::PathBuf};

use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;

const LOCAL_CONFIG_PATH: &str = "config/monitor.toml";
const CONFIG_OVERRIDE_ENV: &str = "BOOKFERRY_MONITOR_CONFIG_FILE";

#[derive(Debug, Error)]
pub enum MonitorConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct MonitorConfig {
    #[serde(default)]
    pub run_dir: Option<PathBuf>,
    #[serde(default = "MonitorConfig::default_check_interval_secs")]
    pub check_interval_secs: u64,
    #[serde(default = "MonitorConfig::default_stuck_threshold_minutes")]
    pub stuck_threshold_minutes: u64,
    #[serde(default = "MonitorConfig::default_shard_count")]
    pub shard_count: u32,
    #[serde(default)]
    pub disk_device: Option<String>,
    #[serde(default)]
    pub fleet: FleetSettings,
    #[serde(default)]
    pub fixes: FixSettings,
    #[serde(default)]
    pub oracle: OracleSettings,
}

impl MonitorConfig {
    fn default_check_interval_secs() -> u64 {
        60
    }

    fn default_stuck_threshold_minutes() -> u64 {
        5
    }

    fn default_shard_count() -> u32 {
        8
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FleetSettings {
    #[serde(default = "FleetSettings::default_min")]
    pub min_workers: usize,
    #[serde(default = "FleetSettings::default_target")]
    pub target_workers: usize,
    #[serde(default = "FleetSettings::default_max")]
    pub max_workers: usize,
}

impl FleetSettings {
    fn default_min() -> usize {
        1
    }

    fn default_target() -> usize {
        4
    }

    fn default_max() -> usize {
        8
    }
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            min_workers: Self::default_min(),
            target_workers: Self::default_target(),
            max_workers: Self::default_max(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FixSettings {
    #[serde(default = "FixSettings::default_restart_script")]
    pub restart_script: PathBuf,
    /// Worker source file code patches may target. Unset disables code
    /// fixes regardless of `enable_code`.
    #[serde(default)]
    pub worker_source_file: Option<PathBuf>,
    /// Compile gate run after a patch, in the source file's directory.
    #[serde(default = "FixSettings::default_validate_command")]
    pub validate_command: Vec<String>,
    /// The code-fix path is powerful and risky; deployments opt in.
    #[serde(default)]
    pub enable_code: bool,
    #[serde(default = "FixSettings::default_cooldown_minutes")]
    pub cooldown_minutes: u64,
    #[serde(default = "FixSettings::default_max_attempts")]
    pub max_attempts: u32,
}

impl FixSettings {
    fn default_restart_script() -> PathBuf {
        PathBuf::from("scripts/restart-worker.sh")
    }

    fn default_validate_command() -> Vec<String> {
        vec!["cargo".to_string(), "check".to_string(), "--quiet".to_string()]
    }

    fn default_cooldown_minutes() -> u64 {
        10
    }

    fn default_max_attempts() -> u32 {
        3
    }
}

impl Default for FixSettings {
    fn default() -> Self {
        Self {
            restart_script: Self::default_restart_script(),
            worker_source_file: None,
            validate_command: Self::default_validate_command(),
            enable_code: false,
            cooldown_minutes: Self::default_cooldown_minutes(),
            max_attempts: Self::default_max_attempts(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleSettings {
    #[serde(default = "OracleSettings::default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

impl OracleSettings {
    fn default_base_url() -> String {
        "https://api.openai.com/".to_string()
    }
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            base_url: Self::default_base_url(),
            api_key: None,
            model: None,
        }
    }
}

pub fn load() -> Result<MonitorConfig, MonitorConfigError> {
    let dirs = ProjectDirs::from("dev", "bookferry", "bookferry")
        .ok_or(MonitorConfigError::MissingProjectDirs)?;

    let mut builder = Config::builder()
        .set_default("check_interval_secs", 60i64)?
        .set_default("stuck_threshold_minutes", 5i64)?
        .set_default("shard_count", 8i64)?;

    let paths = [
        PathBuf::from("/etc/xdg/bookferry/monitor.toml"),
        dirs.config_dir().join("monitor.toml"),
        PathBuf::from(LOCAL_CONFIG_PATH),
    ];
    for path in paths {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }

    if let Some(raw) = env::var_os(CONFIG_OVERRIDE_ENV) {
        builder = builder.add_source(
            File::from(PathBuf::from(raw))
                .format(FileFormat::Toml)
                .required(true),
        );
    }

    builder = builder.add_source(Environment::with_prefix("BOOKFERRY_MONITOR").separator("__"));

    let cfg: MonitorConfig = builder.build()?.try_deserialize()?;
    validate(&cfg)?;
    Ok(cfg)
}

fn validate(config: &MonitorConfig) -> Result<(), MonitorConfigError> {
    if config.fleet.min_workers == 0 {
        return Err(message("fleet.min_workers must be at least 1"));
    }
    if config.fleet.target_workers < config.fleet.min_workers {
        return Err(message("fleet.target_workers must be >= fleet.min_workers"));
    }
    if config.fleet.max_workers < config.fleet.target_workers {
        return Err(message("fleet.max_workers must be >= fleet.target_workers"));
    }
    if config.shard_count == 0 {
        return Err(message("shard_count must be positive"));
    }
    if config.fixes.enable_code && config.fixes.worker_source_file.is_none() {
        return Err(message(
            "fixes.enable_code requires fixes.worker_source_file",
        ));
    }
    Ok(())
}

fn message<S: Into<String>>(text: S) -> MonitorConfigError {
    MonitorConfigError::Build(config::ConfigError::Message(text.into()))
}
