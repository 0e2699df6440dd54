//! Shared fixtures for the end-to-end specs: an in-memory target service
//! and a disk-backed catalog built from a real SQLite database.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::Connection;
use tempfile::TempDir;

use bookferry_app::catalog::SqliteCatalog;
use bookferry_app::fingerprint::{Fingerprint, fingerprint};
use bookferry_app::metadata::BookMeta;
use bookferry_app::remote::{
    TargetClient, TargetError, TransferProgress, UploadReceipt, UploadSource, UploadStatus,
};

/// In-memory stand-in for the ingestion service. Hashes uploads server-side
/// the same way the real service does, so duplicate detection is faithful.
#[derive(Default)]
pub struct MemoryTarget {
    inner: Mutex<TargetState>,
}

#[derive(Default)]
struct TargetState {
    fingerprints: HashSet<Fingerprint>,
    new_uploads: Vec<Fingerprint>,
    upload_calls: u64,
    fail_remaining: HashMap<PathBuf, u32>,
}

impl MemoryTarget {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pretend these fingerprints were migrated earlier.
    pub fn preload<I: IntoIterator<Item = Fingerprint>>(&self, fingerprints: I) {
        let mut state = self.inner.lock().unwrap();
        state.fingerprints.extend(fingerprints);
    }

    /// Answer the next `times` uploads of `path` with a server error.
    pub fn fail_times(&self, path: &Path, times: u32) {
        let mut state = self.inner.lock().unwrap();
        state.fail_remaining.insert(path.to_path_buf(), times);
    }

    pub fn new_upload_count(&self) -> usize {
        self.inner.lock().unwrap().new_uploads.len()
    }

    pub fn upload_calls(&self) -> u64 {
        self.inner.lock().unwrap().upload_calls
    }

    pub fn fingerprints(&self) -> HashSet<Fingerprint> {
        self.inner.lock().unwrap().fingerprints.clone()
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.inner.lock().unwrap().fingerprints.contains(fp)
    }
}

#[async_trait]
impl TargetClient for MemoryTarget {
    async fn exists(&self, fp: &Fingerprint) -> Result<bool, TargetError> {
        Ok(self.inner.lock().unwrap().fingerprints.contains(fp))
    }

    async fn all_fingerprints(&self) -> Result<HashSet<Fingerprint>, TargetError> {
        Ok(self.fingerprints())
    }

    async fn upload(
        &self,
        _meta: &BookMeta,
        source: &UploadSource,
        _progress: &TransferProgress,
    ) -> Result<UploadReceipt, TargetError> {
        let path = source.path().clone();
        let fp = fingerprint(&path).map_err(|_| TargetError::UnexpectedStatus {
            status: 400,
            body: "unreadable payload".to_string(),
        })?;

        let mut state = self.inner.lock().unwrap();
        state.upload_calls += 1;

        if let Some(remaining) = state.fail_remaining.get_mut(&path) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(UploadReceipt {
                    status: UploadStatus::ServerError,
                    server_fingerprint: None,
                });
            }
        }

        let status = if state.fingerprints.contains(&fp) {
            UploadStatus::Duplicate
        } else {
            state.fingerprints.insert(fp.clone());
            state.new_uploads.push(fp.clone());
            UploadStatus::New
        };
        Ok(UploadReceipt {
            status,
            server_fingerprint: Some(fp),
        })
    }
}

/// Build a library on disk: catalog rows in SQLite plus one epub per key
/// with unique contents.
pub fn fixture_library(temp: &TempDir, keys: &[i64]) -> SqliteCatalog {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "CREATE TABLE books (id INTEGER PRIMARY KEY, path TEXT, title TEXT, series_index REAL);\
         CREATE TABLE data (book INTEGER, name TEXT, format TEXT);",
    )
    .expect("schema");

    for key in keys {
        let rel_dir = format!("Author {key}/Book {key}");
        let dir = temp.path().join(&rel_dir);
        std::fs::create_dir_all(&dir).expect("book dir");
        std::fs::write(
            dir.join(format!("book{key}.epub")),
            format!("PK\x03\x04content-{key}"),
        )
        .expect("book file");
        conn.execute(
            "INSERT INTO books (id, path, title, series_index) VALUES (?1, ?2, ?3, NULL)",
            rusqlite::params![key, rel_dir, format!("Book {key}")],
        )
        .expect("insert book");
        conn.execute(
            "INSERT INTO data (book, name, format) VALUES (?1, ?2, 'EPUB')",
            rusqlite::params![key, format!("book{key}")],
        )
        .expect("insert data");
    }

    SqliteCatalog::from_connection(temp.path(), conn)
}

/// Path of the fixture file for `key`, as `fixture_library` laid it out.
pub fn fixture_book_path(temp: &TempDir, key: i64) -> PathBuf {
    temp.path()
        .join(format!("Author {key}/Book {key}/book{key}.epub"))
}

/// Fingerprint of the fixture file for `key`.
pub fn fixture_fingerprint(temp: &TempDir, key: i64) -> Fingerprint {
    fingerprint(&fixture_book_path(temp, key)).expect("fixture fingerprint")
}
