//! Shard worker: owns one shard of the catalog keyspace and drives records
//! through dedup, fingerprinting, metadata extraction, and upload.

mod runner;
mod types;

pub use runner::{Worker, collect_peer_fingerprints};
pub use types::{
    BatchStats, WorkerError, WorkerEvent, WorkerOptions, WorkerSummary,
};
