//! Executing fixes against the fleet.
//!
//! Restart and config fixes go through the operator-provided restart script,
//! which stops the stuck process, reads its checkpoint, and relaunches with
//! the same shard id. Code fixes snapshot the target file to a timestamped
//! backup, apply a structured patch, run the validation gate, and only then
//! commit; any validation failure restores the backup byte-for-byte.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

use super::patch::{PatchError, PatchSpec};

const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum FixError {
    #[error("restart script `{script}` failed: {reason}")]
    RestartFailed { script: String, reason: String },
    #[error("code fixes are disabled by configuration")]
    CodeFixesDisabled,
    #[error("no worker source file configured for code fixes")]
    NoSourceFile,
    #[error(transparent)]
    Patch(#[from] PatchError),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("validation command failed: {0}")]
    ValidationFailed(String),
}

/// Operational parameters a restart may override.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RestartParams {
    pub parallel_uploads: Option<usize>,
    pub batch_size: Option<usize>,
}

/// What a fix actually did, recorded into history.
#[derive(Debug, Clone)]
pub struct AppliedFix {
    pub description: String,
    pub diff: Option<String>,
    pub backup: Option<PathBuf>,
}

/// Executes fixes. All side effects are suppressed in dry-run mode.
#[derive(Debug, Clone)]
pub struct FixExecutor {
    restart_script: PathBuf,
    backup_dir: PathBuf,
    /// Worker source file code patches apply to; `None` disables code fixes.
    source_file: Option<PathBuf>,
    /// Compile gate run after the structural check, e.g. `cargo check`.
    validate_command: Vec<String>,
    enable_code_fixes: bool,
    dry_run: bool,
}

impl FixExecutor {
    pub fn new(
        restart_script: PathBuf,
        backup_dir: PathBuf,
        source_file: Option<PathBuf>,
        validate_command: Vec<String>,
        enable_code_fixes: bool,
        dry_run: bool,
    ) -> Self {
        Self {
            restart_script,
            backup_dir,
            source_file,
            validate_command,
            enable_code_fixes,
            dry_run,
        }
    }

    /// Restart a worker, optionally with changed parameters (the config
    /// fix is a restart with different knobs).
    pub async fn restart(
        &self,
        shard_id: u32,
        params: RestartParams,
    ) -> Result<AppliedFix, FixError> {
        let parallel = params.parallel_uploads.unwrap_or(1);
        let description = match params.batch_size {
            Some(batch) => format!(
                "restart worker {shard_id} with parallel_uploads={parallel} batch_size={batch}"
            ),
            None => format!("restart worker {shard_id} with parallel_uploads={parallel}"),
        };

        if self.dry_run {
            info!(shard_id, "[dry-run] {description}");
            return Ok(AppliedFix {
                description,
                diff: None,
                backup: None,
            });
        }

        let mut command = Command::new(&self.restart_script);
        command
            .arg(shard_id.to_string())
            .arg(parallel.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(batch) = params.batch_size {
            command.arg(batch.to_string());
        }

        let script = self.restart_script.display().to_string();
        let output = tokio::time::timeout(SCRIPT_TIMEOUT, command.output())
            .await
            .map_err(|_| FixError::RestartFailed {
                script: script.clone(),
                reason: "timed out".to_string(),
            })?
            .map_err(|err| FixError::RestartFailed {
                script: script.clone(),
                reason: err.to_string(),
            })?;

        if !output.status.success() {
            return Err(FixError::RestartFailed {
                script,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!(shard_id, "worker restarted");
        Ok(AppliedFix {
            description,
            diff: None,
            backup: None,
        })
    }

    /// Apply a validated code patch, then restart the worker so it picks the
    /// change up.
    pub async fn code_fix(
        &self,
        shard_id: u32,
        patch: &PatchSpec,
    ) -> Result<AppliedFix, FixError> {
        if !self.enable_code_fixes {
            return Err(FixError::CodeFixesDisabled);
        }
        let source_file = self.source_file.as_ref().ok_or(FixError::NoSourceFile)?;

        let original = std::fs::read_to_string(source_file).map_err(|source| FixError::Read {
            path: source_file.clone(),
            source,
        })?;
        // The structural gate runs inside apply().
        let patched = patch.apply(&original)?;
        let diff = serde_json::to_string(patch).ok();

        if self.dry_run {
            info!(shard_id, "[dry-run] would apply code fix and restart");
            return Ok(AppliedFix {
                description: format!("code fix for worker {shard_id} (dry run)"),
                diff,
                backup: None,
            });
        }

        let backup = self.backup_path(source_file);
        std::fs::copy(source_file, &backup).map_err(|source| FixError::Write {
            path: backup.clone(),
            source,
        })?;

        std::fs::write(source_file, &patched).map_err(|source| FixError::Write {
            path: source_file.clone(),
            source,
        })?;

        if let Err(err) = self.validate(source_file).await {
            warn!(error = %err, "patch failed validation; restoring backup");
            if let Err(restore) = std::fs::copy(&backup, source_file) {
                warn!(error = %restore, backup = %backup.display(), "backup restore failed");
            }
            return Err(err);
        }

        self.restart(shard_id, RestartParams::default()).await?;
        Ok(AppliedFix {
            description: format!("code fix applied to {}", source_file.display()),
            diff,
            backup: Some(backup),
        })
    }

    fn backup_path(&self, source_file: &Path) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let name = source_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source.rs".to_string());
        self.backup_dir.join(format!("{name}.{stamp}.bak"))
    }

    /// Compile gate. An empty command list skips the gate (the structural
    /// check has already run).
    async fn validate(&self, source_file: &Path) -> Result<(), FixError> {
        let Some((program, args)) = self.validate_command.split_first() else {
            return Ok(());
        };

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = source_file.parent() {
            command.current_dir(dir);
        }

        let output = tokio::time::timeout(VALIDATE_TIMEOUT, command.output())
            .await
            .map_err(|_| FixError::ValidationFailed("validation timed out".to_string()))?
            .map_err(|err| FixError::ValidationFailed(err.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FixError::ValidationFailed(
                stderr.trim().chars().take(1024).collect(),
            ));
        }
        Ok(())
    }
}
