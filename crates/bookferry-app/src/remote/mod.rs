//! Narrow interface to the target ingestion service.
//!
//! Everything the pipeline needs from the service fits in three calls:
//! a fingerprint pre-check, a bulk fingerprint dump for the mirror, and the
//! upload itself. The service's internals stay behind [`TargetClient`].

mod http;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::metadata::BookMeta;

pub use http::HttpTargetClient;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("target request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("target returned unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("target response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid target base url `{0}`")]
    InvalidBaseUrl(String),
    #[error("failed to read upload payload {path}: {source}")]
    Payload {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TargetError {
    /// Whether a retry has any chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            TargetError::Http(err) => {
                err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
            }
            TargetError::UnexpectedStatus { status, .. } => *status >= 500,
            TargetError::Decode(_) => false,
            TargetError::InvalidBaseUrl(_) => false,
            TargetError::Payload { .. } => false,
        }
    }
}

/// Upload disposition reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    New,
    Duplicate,
    SizeRejected,
    ValidationRejected,
    ServerError,
}

/// Successful (HTTP-level) upload response.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadReceipt {
    pub status: UploadStatus,
    #[serde(default)]
    pub server_fingerprint: Option<Fingerprint>,
}

/// How the file reaches the service.
#[derive(Debug, Clone)]
pub enum UploadSource {
    /// Stream the file bytes over the wire.
    Bytes(PathBuf),
    /// Send only the path; the service has read access to the library
    /// filesystem and links the file in place ("symlink mode").
    PathRef(PathBuf),
}

impl UploadSource {
    pub fn path(&self) -> &PathBuf {
        match self {
            UploadSource::Bytes(path) | UploadSource::PathRef(path) => path,
        }
    }
}

/// Shared byte counter advanced as the request body streams out; the upload
/// watchdog samples it to distinguish slow from stuck.
#[derive(Debug, Clone, Default)]
pub struct TransferProgress(Arc<AtomicU64>);

impl TransferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn bytes(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Client-side view of the target service.
#[async_trait]
pub trait TargetClient: Send + Sync {
    /// Cheap pre-check: does the service already hold this fingerprint?
    async fn exists(&self, fp: &Fingerprint) -> Result<bool, TargetError>;

    /// Full fingerprint set for the remote mirror; may be long-running.
    async fn all_fingerprints(&self) -> Result<HashSet<Fingerprint>, TargetError>;

    /// Perform one upload attempt. `progress` is advanced as payload bytes
    /// leave the process; path-reference uploads move no payload bytes.
    async fn upload(
        &self,
        meta: &BookMeta,
        source: &UploadSource,
        progress: &TransferProgress,
    ) -> Result<UploadReceipt, TargetError>;
}
