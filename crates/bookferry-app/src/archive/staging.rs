//! Staging-directory management: extraction-folder reuse, free-space guards,
//! and subprocess tar extraction.
//!
//! Extractions of multi-gigabyte archives are expensive and frequently
//! survive a worker crash, so a fresh worker first hunts for a usable folder
//! left behind by a previous attempt before unpacking again.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;

use nix::sys::statvfs::statvfs;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("staging filesystem below free-space floor: {free} of {required} bytes available")]
    InsufficientSpace { free: u64, required: u64 },
    #[error("failed to inspect staging filesystem {path}: {reason}")]
    Statvfs { path: PathBuf, reason: String },
    #[error("failed to create extraction directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tar extraction of {archive} failed: {reason}")]
    Extraction { archive: PathBuf, reason: String },
}

/// An extraction folder chosen for processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractionDir {
    pub path: PathBuf,
    /// Reused folders are never deleted on cleanup.
    pub reused: bool,
}

/// Verify the staging filesystem holds at least `required` free bytes.
pub fn check_free_space(staging: &Path, required: u64) -> Result<(), StagingError> {
    let stats = statvfs(staging).map_err(|errno| StagingError::Statvfs {
        path: staging.to_path_buf(),
        reason: errno.to_string(),
    })?;
    let free = stats.blocks_available() as u64 * stats.fragment_size() as u64;
    if free < required {
        return Err(StagingError::InsufficientSpace { free, required });
    }
    Ok(())
}

/// Look for an existing extraction folder for `base` (folders are named
/// `<base>_<timestamp>`). Candidates must contain at least one file; the one
/// with the most files wins, ties broken by the most recent mtime.
pub fn find_reusable_extraction(staging: &Path, base: &str) -> Option<ExtractionDir> {
    let prefix = format!("{base}_");
    let mut best: Option<(usize, SystemTime, PathBuf)> = None;

    let entries = std::fs::read_dir(staging).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(&prefix) {
            continue;
        }

        let file_count = count_files(&path);
        if file_count == 0 {
            continue;
        }
        let mtime = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let better = match &best {
            None => true,
            Some((count, at, _)) => file_count > *count || (file_count == *count && mtime > *at),
        };
        if better {
            best = Some((file_count, mtime, path));
        }
    }

    best.map(|(count, _, path)| {
        info!(path = %path.display(), files = count, "reusing existing extraction folder");
        ExtractionDir { path, reused: true }
    })
}

/// Unpack `archive` into a fresh timestamped folder under `staging` via the
/// system tar binary.
pub async fn extract_archive(
    archive: &Path,
    staging: &Path,
    base: &str,
) -> Result<ExtractionDir, StagingError> {
    let dir = staging.join(format!("{base}_{}", chrono::Utc::now().timestamp()));
    std::fs::create_dir_all(&dir).map_err(|source| StagingError::CreateDir {
        path: dir.clone(),
        source,
    })?;

    let output = Command::new("tar")
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(&dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|err| StagingError::Extraction {
            archive: archive.to_path_buf(),
            reason: err.to_string(),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(StagingError::Extraction {
            archive: archive.to_path_buf(),
            reason: format!(
                "exit status {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            ),
        });
    }

    Ok(ExtractionDir {
        path: dir,
        reused: false,
    })
}

/// All regular files under an extraction folder, in stable order.
pub fn list_extracted_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

fn count_files(dir: &Path) -> usize {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        std::fs::create_dir_all(dir).expect("dir");
        std::fs::write(dir.join(name), b"x").expect("file");
    }

    #[test]
    fn reuse_prefers_folder_with_most_files() {
        let temp = TempDir::new().expect("temp dir");
        let sparse = temp.path().join("bundle-01_100");
        touch(&sparse, "a.epub");
        let dense = temp.path().join("bundle-01_200");
        touch(&dense, "a.epub");
        touch(&dense, "b.epub");

        let chosen = find_reusable_extraction(temp.path(), "bundle-01").expect("found");
        assert_eq!(chosen.path, dense);
        assert!(chosen.reused);
    }

    #[test]
    fn reuse_ignores_empty_folders_and_other_bases() {
        let temp = TempDir::new().expect("temp dir");
        std::fs::create_dir_all(temp.path().join("bundle-01_100")).expect("empty dir");
        touch(&temp.path().join("bundle-02_100"), "a.epub");

        assert!(find_reusable_extraction(temp.path(), "bundle-01").is_none());
    }

    #[test]
    fn reuse_counts_nested_files() {
        let temp = TempDir::new().expect("temp dir");
        let nested = temp.path().join("bundle-01_100").join("bundle-01").join("sub");
        touch(&nested, "deep.epub");

        let chosen = find_reusable_extraction(temp.path(), "bundle-01").expect("found");
        assert!(chosen.path.ends_with("bundle-01_100"));
    }

    #[test]
    fn free_space_floor_is_enforced() {
        let temp = TempDir::new().expect("temp dir");
        assert!(check_free_space(temp.path(), 1).is_ok());
        let err = check_free_space(temp.path(), u64::MAX).expect_err("floor");
        assert!(matches!(err, StagingError::InsufficientSpace { .. }));
    }

    #[tokio::test]
    async fn extraction_round_trips_through_system_tar() {
        if std::process::Command::new("tar")
            .arg("--version")
            .output()
            .is_err()
        {
            // No tar binary in this environment.
            return;
        }

        let temp = TempDir::new().expect("temp dir");
        let payload = temp.path().join("payload");
        touch(&payload, "book.epub");
        let archive = temp.path().join("bundle.tar");
        let status = std::process::Command::new("tar")
            .arg("-cf")
            .arg(&archive)
            .arg("-C")
            .arg(temp.path())
            .arg("payload")
            .status()
            .expect("create tar");
        assert!(status.success());

        let staging = temp.path().join("staging");
        std::fs::create_dir_all(&staging).expect("staging");
        let extracted = extract_archive(&archive, &staging, "bundle")
            .await
            .expect("extract");
        assert!(!extracted.reused);

        let files = list_extracted_files(&extracted.path);
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("payload/book.epub"));
    }

    #[tokio::test]
    async fn extraction_of_missing_archive_fails() {
        let temp = TempDir::new().expect("temp dir");
        let err = extract_archive(&temp.path().join("absent.tar"), temp.path(), "absent")
            .await
            .expect_err("missing archive");
        assert!(matches!(err, StagingError::Extraction { .. }));
    }
}
