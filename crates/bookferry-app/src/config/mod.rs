//! Configuration loading and validation.
//!
//! Layered sources, later wins: `/etc/xdg/bookferry/settings.toml`, the XDG
//! config dir, a local `config/settings.toml`, an explicit override file, and
//! finally `BOOKFERRY`-prefixed environment variables (`__` separator).
//! Credentials are only ever read from the environment layer.

use std::{env, path::PathBuf};

use config::{Config, Environment, File, FileFormat};
use directories::ProjectDirs;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

const LOCAL_CONFIG_PATH: &str = "config/settings.toml";
const ETC_CONFIG_ENV: &str = "BOOKFERRY_ETC_CONFIG_DIR";
const CONFIG_OVERRIDE_ENV: &str = "BOOKFERRY_CONFIG_FILE";
const ETC_CONFIG_DEFAULT: &str = "/etc/xdg";

pub const MIN_PARALLEL_UPLOADS: usize = 1;
pub const MAX_PARALLEL_UPLOADS: usize = 10;

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("unable to resolve project directories")]
    MissingProjectDirs,
    #[error(transparent)]
    Build(#[from] config::ConfigError),
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub target: TargetConfig,
    pub worker: WorkerConfig,
    pub watchdog: WatchdogSettings,
    #[serde(default)]
    pub run_dir: Option<PathBuf>,
    #[serde(default)]
    pub staging: StagingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TargetConfig {
    pub base_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Ask the service whether a fingerprint exists before uploading.
    #[serde(default = "TargetConfig::default_precheck")]
    pub precheck: bool,
    /// Version-pinned exit code the service CLI uses for "already exists";
    /// only consulted by subprocess transports.
    #[serde(default = "TargetConfig::default_duplicate_exit_code")]
    pub duplicate_exit_code: i32,
}

impl TargetConfig {
    fn default_precheck() -> bool {
        true
    }

    fn default_duplicate_exit_code() -> i32 {
        3
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    #[serde(default = "WorkerConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "WorkerConfig::default_parallel_uploads")]
    pub parallel_uploads: usize,
    #[serde(default = "WorkerConfig::default_skip_ahead_after")]
    pub skip_ahead_after: u32,
    #[serde(default = "WorkerConfig::default_skip_ahead_stride")]
    pub skip_ahead_stride: i64,
    #[serde(default = "WorkerConfig::default_metadata_tool")]
    pub metadata_tool: PathBuf,
    #[serde(default = "WorkerConfig::default_mirror_refresh_files")]
    pub mirror_refresh_files: usize,
    #[serde(default = "WorkerConfig::default_mirror_refresh_minutes")]
    pub mirror_refresh_minutes: u64,
}

impl WorkerConfig {
    fn default_batch_size() -> usize {
        1_000
    }

    fn default_parallel_uploads() -> usize {
        1
    }

    fn default_skip_ahead_after() -> u32 {
        5
    }

    fn default_skip_ahead_stride() -> i64 {
        10_000
    }

    fn default_metadata_tool() -> PathBuf {
        PathBuf::from("/usr/bin/ebook-meta")
    }

    fn default_mirror_refresh_files() -> usize {
        1_500
    }

    fn default_mirror_refresh_minutes() -> u64 {
        15
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            parallel_uploads: Self::default_parallel_uploads(),
            skip_ahead_after: Self::default_skip_ahead_after(),
            skip_ahead_stride: Self::default_skip_ahead_stride(),
            metadata_tool: Self::default_metadata_tool(),
            mirror_refresh_files: Self::default_mirror_refresh_files(),
            mirror_refresh_minutes: Self::default_mirror_refresh_minutes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatchdogSettings {
    #[serde(default = "WatchdogSettings::default_probe_secs")]
    pub probe_secs: u64,
    #[serde(default = "WatchdogSettings::default_stall_secs")]
    pub stall_secs: u64,
    #[serde(default = "WatchdogSettings::default_hard_secs")]
    pub hard_secs: u64,
}

impl WatchdogSettings {
    fn default_probe_secs() -> u64 {
        60
    }

    fn default_stall_secs() -> u64 {
        240
    }

    fn default_hard_secs() -> u64 {
        600
    }
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            probe_secs: Self::default_probe_secs(),
            stall_secs: Self::default_stall_secs(),
            hard_secs: Self::default_hard_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StagingConfig {
    /// Extraction area override; defaults to `<run_dir>/staging`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "StagingConfig::default_min_free_gib")]
    pub min_free_gib: u64,
}

impl StagingConfig {
    fn default_min_free_gib() -> u64 {
        10
    }
}

pub fn load() -> Result<AppConfig, AppConfigError> {
    let dirs = project_dirs()?;
    let mut builder = Config::builder()
        .set_default("target.base_url", "http://127.0.0.1:6006/")?
        .set_default("target.precheck", true)?
        .set_default("worker.batch_size", 1_000i64)?
        .set_default("worker.parallel_uploads", 1i64)?
        .set_default("watchdog.probe_secs", 60i64)?
        .set_default("watchdog.stall_secs", 240i64)?
        .set_default("watchdog.hard_secs", 600i64)?;

    for path in base_config_paths(&dirs) {
        builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(false));
    }

    if let Some(override_path) = config_override_path()? {
        builder = builder.add_source(
            File::from(override_path)
                .format(FileFormat::Toml)
                .required(true),
        );
    }

    builder = builder.add_source(Environment::with_prefix("BOOKFERRY").separator("__"));

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn project_dirs() -> Result<ProjectDirs, AppConfigError> {
    ProjectDirs::from("dev", "bookferry", "bookferry").ok_or(AppConfigError::MissingProjectDirs)
}

fn base_config_paths(dirs: &ProjectDirs) -> [PathBuf; 3] {
    let etc_root = etc_config_dir();
    [
        etc_root.join("bookferry").join("settings.toml"),
        dirs.config_dir().join("settings.toml"),
        PathBuf::from(LOCAL_CONFIG_PATH),
    ]
}

fn config_override_path() -> Result<Option<PathBuf>, AppConfigError> {
    match env::var_os(CONFIG_OVERRIDE_ENV) {
        None => Ok(None),
        Some(raw) => {
            let path = PathBuf::from(raw);
            if path.as_os_str().is_empty() {
                return Err(invalid_config("BOOKFERRY_CONFIG_FILE must not be empty"));
            }
            Ok(Some(path))
        }
    }
}

fn etc_config_dir() -> PathBuf {
    match env::var_os(ETC_CONFIG_ENV) {
        Some(raw) => {
            let path = PathBuf::from(&raw);
            if path.as_os_str().is_empty() {
                PathBuf::from(ETC_CONFIG_DEFAULT)
            } else {
                path
            }
        }
        None => PathBuf::from(ETC_CONFIG_DEFAULT),
    }
}

fn validate_config(config: &AppConfig) -> Result<(), AppConfigError> {
    let url = Url::parse(&config.target.base_url).map_err(|_| {
        invalid_config(format!(
            "invalid target base_url `{}`",
            config.target.base_url
        ))
    })?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(invalid_config(format!(
                "target base_url must use http or https (found {other})"
            )));
        }
    }

    if !(MIN_PARALLEL_UPLOADS..=MAX_PARALLEL_UPLOADS).contains(&config.worker.parallel_uploads) {
        return Err(invalid_config(format!(
            "worker.parallel_uploads must be within [{MIN_PARALLEL_UPLOADS}..{MAX_PARALLEL_UPLOADS}]"
        )));
    }

    if config.worker.batch_size == 0 {
        return Err(invalid_config("worker.batch_size must be positive"));
    }

    if config.watchdog.stall_secs < config.watchdog.probe_secs {
        return Err(invalid_config(
            "watchdog.stall_secs must be at least watchdog.probe_secs",
        ));
    }
    if config.watchdog.hard_secs < config.watchdog.stall_secs {
        return Err(invalid_config(
            "watchdog.hard_secs must be at least watchdog.stall_secs",
        ));
    }

    Ok(())
}

fn invalid_config<S: Into<String>>(message: S) -> AppConfigError {
    AppConfigError::Build(config::ConfigError::Message(message.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> AppConfig {
        AppConfig {
            target: TargetConfig {
                base_url: "http://127.0.0.1:6006/".to_string(),
                username: "admin".to_string(),
                password: String::new(),
                precheck: true,
                duplicate_exit_code: 3,
            },
            worker: WorkerConfig::default(),
            watchdog: WatchdogSettings::default(),
            run_dir: None,
            staging: StagingConfig::default(),
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(validate_config(&valid()).is_ok());
    }

    #[test]
    fn parallel_uploads_bounds_are_enforced() {
        let mut config = valid();
        config.worker.parallel_uploads = 0;
        assert!(validate_config(&config).is_err());
        config.worker.parallel_uploads = 11;
        assert!(validate_config(&config).is_err());
        config.worker.parallel_uploads = 10;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn non_http_target_is_rejected() {
        let mut config = valid();
        config.target.base_url = "ftp://example.com/".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn watchdog_ordering_is_enforced() {
        let mut config = valid();
        config.watchdog.hard_secs = 10;
        assert!(validate_config(&config).is_err());
    }
}
