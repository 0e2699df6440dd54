//! Archive-mode worker: the same dedup/extract/upload pipeline fed from tar
//! bundles instead of catalog batches.

mod runner;
mod staging;
mod types;

pub use runner::{ArchiveWorker, assign_round_robin};
pub use staging::{ExtractionDir, StagingError, check_free_space, find_reusable_extraction};
pub use types::{ArchiveEvent, ArchiveOptions, ArchiveRunSummary, ArchiveWorkerError};
