//! Read-only access to the source library catalog.
//!
//! Workers never touch the library through anything but this interface; the
//! catalog database and the files it points at are opened read-only.

mod sqlite;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::fingerprint::FileFormat;

pub use sqlite::{CatalogError, SqliteCatalog};

/// Metadata the catalog already knows, saving a tool invocation when present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrefetchedMeta {
    pub title: Option<String>,
    pub authors: Vec<String>,
    pub language: Option<String>,
    pub series: Option<String>,
    pub series_index: Option<f64>,
}

/// One candidate item from the source catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    /// Monotonic catalog primary key; drives sharding and checkpointing.
    pub shard_key: i64,
    pub path: PathBuf,
    pub format_hint: FileFormat,
    pub prefetched: Option<PrefetchedMeta>,
}

/// Query interface over the source catalog.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Records with `key > last_key` and `key % shard_count == shard_id`,
    /// ascending by key, at most `limit`.
    async fn next_batch(
        &self,
        shard_id: u32,
        shard_count: u32,
        last_key: i64,
        limit: usize,
    ) -> Result<Vec<SourceRecord>, CatalogError>;

    /// Total record count, for reporting only.
    async fn count_total(&self) -> Result<u64, CatalogError>;
}
