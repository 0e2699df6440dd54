//! Filesystem path helpers (XDG-aware) for progress files, logs, and staging.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("unable to determine project directories")]
    MissingProjectDirs,
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Container providing filesystem paths for a migration run. In production
/// this is rooted at `$XDG_DATA_HOME/bookferry`; tests may construct custom
/// instances.
#[derive(Debug, Clone)]
pub struct RunPaths {
    base_dir: PathBuf,
}

impl RunPaths {
    /// Construct paths rooted under `$XDG_DATA_HOME/bookferry`.
    pub fn from_project_dirs() -> Result<Self, PathError> {
        let dirs = ProjectDirs::from("dev", "bookferry", "bookferry")
            .ok_or(PathError::MissingProjectDirs)?;
        Self::new(dirs.data_dir())
    }

    /// Construct paths rooted under the provided directory, ensuring it exists.
    pub fn new<P: AsRef<Path>>(base: P) -> Result<Self, PathError> {
        let base = base.as_ref().to_path_buf();
        ensure_dir(&base)?;
        Ok(Self { base_dir: base })
    }

    /// Base run directory.
    pub fn base_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }

    /// Durable checkpoint file for one shard worker.
    pub fn progress_file(&self, shard_id: u32) -> PathBuf {
        self.base_dir
            .join(format!("progress-worker{shard_id}.json"))
    }

    /// All progress files currently present, with their shard ids.
    pub fn list_progress_files(&self) -> Vec<(u32, PathBuf)> {
        let Ok(entries) = fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(rest) = name
                .strip_prefix("progress-worker")
                .and_then(|r| r.strip_suffix(".json"))
            else {
                continue;
            };
            if let Ok(shard_id) = rest.parse::<u32>() {
                found.push((shard_id, entry.path()));
            }
        }
        found.sort_by_key(|(shard_id, _)| *shard_id);
        found
    }

    /// Per-worker log file; the supervisor parses it for progress signals.
    pub fn worker_log_file(&self, shard_id: u32) -> PathBuf {
        self.base_dir
            .join(format!("migration-worker{shard_id}.log"))
    }

    /// Per-worker permanent-failure log.
    pub fn worker_error_file(&self, shard_id: u32) -> PathBuf {
        self.base_dir
            .join(format!("migration-errors-worker{shard_id}.log"))
    }

    /// Pause flag checked by workers between batches; written by the supervisor.
    pub fn pause_flag(&self, shard_id: u32) -> PathBuf {
        self.base_dir.join(format!("worker{shard_id}.paused"))
    }

    /// Append-mostly supervisor fix history.
    pub fn fix_history_file(&self) -> PathBuf {
        self.base_dir.join("fix-history.json")
    }

    /// Backups taken before a code fix is committed.
    pub fn backup_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child("backups")
    }

    /// Staging area for archive extraction.
    pub fn staging_dir(&self) -> Result<PathBuf, PathError> {
        self.ensure_child("staging")
    }

    fn ensure_child(&self, name: &str) -> Result<PathBuf, PathError> {
        let path = self.base_dir.join(name);
        ensure_dir(&path)?;
        Ok(path)
    }
}

fn ensure_dir(path: &Path) -> Result<(), PathError> {
    fs::create_dir_all(path).map_err(|source| PathError::CreateDir {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn progress_files_are_discovered_in_shard_order() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RunPaths::new(temp.path()).expect("paths");

        fs::write(paths.progress_file(3), "{}").expect("write");
        fs::write(paths.progress_file(0), "{}").expect("write");
        fs::write(temp.path().join("unrelated.json"), "{}").expect("write");

        let found = paths.list_progress_files();
        let shards: Vec<u32> = found.iter().map(|(id, _)| *id).collect();
        assert_eq!(shards, vec![0, 3]);
    }

    #[test]
    fn staging_dir_is_created_on_demand() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RunPaths::new(temp.path()).expect("paths");
        let staging = paths.staging_dir().expect("staging");
        assert!(staging.is_dir());
    }
}
