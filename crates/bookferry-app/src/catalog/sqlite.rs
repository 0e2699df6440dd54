//! SQLite-backed catalog reader.
//!
//! The source library keeps an indexed catalog database next to the files:
//! `books` holds one row per title with a relative directory path, `data`
//! holds one row per stored format with the bare file name and an uppercase
//! format tag. Both are joined here into [`SourceRecord`]s.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;
use tracing::debug;

use super::{PrefetchedMeta, SourceCatalog, SourceRecord};
use crate::fingerprint::FileFormat;

const FORMATS: &str = "'EPUB','PDF','FB2','MOBI','AZW3','CBZ','CBR','DJVU','LIT'";

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog database not found at {path}")]
    MissingDatabase { path: PathBuf },
    #[error("catalog query failed: {0}")]
    Query(#[from] rusqlite::Error),
    #[error("catalog worker thread failed: {0}")]
    Join(String),
}

/// Read-only connection to the catalog database rooted at the library path.
pub struct SqliteCatalog {
    library_dir: PathBuf,
    // rusqlite connections are not Sync; queries run on the blocking pool
    // with the connection behind a mutex.
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCatalog {
    /// Open `<library>/metadata.db` read-only.
    pub fn open(library_dir: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let library_dir = library_dir.into();
        let db_path = library_dir.join("metadata.db");
        if !db_path.is_file() {
            return Err(CatalogError::MissingDatabase { path: db_path });
        }
        let conn = Connection::open_with_flags(
            &db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            library_dir,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Test seam: wrap an already-open connection (e.g. an in-memory fixture).
    pub fn from_connection(library_dir: impl Into<PathBuf>, conn: Connection) -> Self {
        Self {
            library_dir: library_dir.into(),
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn query_batch(
        conn: &Connection,
        library_dir: &Path,
        shard_id: u32,
        shard_count: u32,
        last_key: i64,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, CatalogError> {
        let sql = format!(
            "SELECT b.id, b.path, d.name, d.format, b.title, b.series_index \
             FROM books b JOIN data d ON d.book = b.id \
             WHERE b.id > ?1 AND (b.id % ?2) = ?3 AND d.format IN ({FORMATS}) \
             ORDER BY b.id ASC LIMIT ?4"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params![last_key, i64::from(shard_count), i64::from(shard_id), limit as i64],
            |row| {
                let id: i64 = row.get(0)?;
                let rel_dir: String = row.get(1)?;
                let name: String = row.get(2)?;
                let format: String = row.get(3)?;
                let title: Option<String> = row.get(4)?;
                let series_index: Option<f64> = row.get(5)?;
                Ok((id, rel_dir, name, format, title, series_index))
            },
        )?;

        let mut records = Vec::with_capacity(limit.min(1024));
        let mut missing = 0usize;
        for row in rows {
            let (id, rel_dir, name, format, title, series_index) = row?;
            let ext = format.to_ascii_lowercase();
            let path = library_dir.join(&rel_dir).join(format!("{name}.{ext}"));
            if !path.is_file() {
                // Catalog rows can outlive their files; skip, the key still
                // advances with the batch.
                missing += 1;
                continue;
            }
            let format_hint = FileFormat::from_str(&ext).unwrap_or(FileFormat::Unknown);
            let prefetched = title.map(|t| PrefetchedMeta {
                title: Some(t),
                authors: Vec::new(),
                language: None,
                series: None,
                series_index,
            });
            records.push(SourceRecord {
                shard_key: id,
                path,
                format_hint,
                prefetched,
            });
        }
        if missing > 0 {
            debug!(missing, "catalog rows without backing files skipped");
        }
        Ok(records)
    }
}

#[async_trait]
impl SourceCatalog for SqliteCatalog {
    async fn next_batch(
        &self,
        shard_id: u32,
        shard_count: u32,
        last_key: i64,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, CatalogError> {
        debug_assert!(shard_count > 0);
        debug_assert!(shard_id < shard_count);
        let conn = Arc::clone(&self.conn);
        let library_dir = self.library_dir.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            Self::query_batch(&conn, &library_dir, shard_id, shard_count, last_key, limit)
        })
        .await
        .map_err(|e| CatalogError::Join(e.to_string()))?
    }

    async fn count_total(&self) -> Result<u64, CatalogError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap_or_else(|e| e.into_inner());
            let sql = format!("SELECT COUNT(*) FROM books b JOIN data d ON d.book = b.id WHERE d.format IN ({FORMATS})");
            let count: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(count.max(0) as u64)
        })
        .await
        .map_err(|e| CatalogError::Join(e.to_string()))?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Build a library fixture: catalog rows plus backing files on disk.
    pub(crate) fn fixture_library(temp: &TempDir, keys: &[i64]) -> SqliteCatalog {
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
            std::fs::write(dir.join(format!("book{key}.epub")), format!("content-{key}"))
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

    #[tokio::test]
    async fn batches_respect_shard_and_ordering() {
        let temp = TempDir::new().expect("temp dir");
        let catalog = fixture_library(&temp, &(1..=10).collect::<Vec<_>>());

        let batch = catalog.next_batch(0, 2, 0, 100).await.expect("batch");
        let keys: Vec<i64> = batch.iter().map(|r| r.shard_key).collect();
        assert_eq!(keys, vec![2, 4, 6, 8, 10]);

        let batch = catalog.next_batch(1, 2, 5, 2).await.expect("batch");
        let keys: Vec<i64> = batch.iter().map(|r| r.shard_key).collect();
        assert_eq!(keys, vec![7, 9]);
    }

    #[tokio::test]
    async fn missing_files_are_skipped() {
        let temp = TempDir::new().expect("temp dir");
        let catalog = fixture_library(&temp, &[1, 2, 3]);
        std::fs::remove_file(temp.path().join("Author 2/Book 2/book2.epub")).expect("remove");

        let batch = catalog.next_batch(0, 1, 0, 100).await.expect("batch");
        let keys: Vec<i64> = batch.iter().map(|r| r.shard_key).collect();
        assert_eq!(keys, vec![1, 3]);
    }

    #[tokio::test]
    async fn count_total_reports_catalog_size() {
        let temp = TempDir::new().expect("temp dir");
        let catalog = fixture_library(&temp, &[5, 6]);
        assert_eq!(catalog.count_total().await.expect("count"), 2);
    }

    #[tokio::test]
    async fn prefetched_title_is_carried() {
        let temp = TempDir::new().expect("temp dir");
        let catalog = fixture_library(&temp, &[9]);
        let batch = catalog.next_batch(0, 1, 0, 10).await.expect("batch");
        let prefetched = batch[0].prefetched.as_ref().expect("prefetched");
        assert_eq!(prefetched.title.as_deref(), Some("Book 9"));
    }
}
