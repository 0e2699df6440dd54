use std::path::PathBuf;

use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};

mod validators;

pub use validators::{validate_parallel_uploads, validate_positive};

/// Top-level CLI entry point.
#[derive(Debug, Parser)]
#[command(
    name = "bookferry",
    version,
    author,
    about = "Bulk ebook library migration workers"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    /// Increase logging verbosity (-v, -vv, -vvv).
    #[arg(global = true, short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn print_help() {
        let mut cmd = Cli::command();
        let _ = cmd.print_help();
        println!();
    }
}

/// Supported subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Migrate one shard of the source catalog.
    Migrate(MigrateArgs),
    /// Ingest assigned tar bundles through the same pipeline.
    Tars(TarsArgs),
    /// Summarize worker progress files and supervisor history.
    Status(StatusArgs),
}

/// Options for one shard worker.
#[derive(Debug, Args)]
pub struct MigrateArgs {
    /// Source library directory (contains the catalog database).
    pub library: PathBuf,
    /// Shard owned by this worker.
    #[arg(long, default_value_t = 0)]
    pub shard_id: u32,
    /// Total number of shards in the fleet.
    #[arg(long, default_value_t = 1, value_parser = validators::validate_positive_u32)]
    pub shard_count: u32,
    /// Override the resume key (deliberate jump; skips everything below).
    #[arg(long)]
    pub last_key: Option<i64>,
    /// Catalog records per batch.
    #[arg(long, value_parser = validators::validate_positive)]
    pub batch_size: Option<usize>,
    /// Concurrent uploads within this worker (1-10).
    #[arg(long, value_parser = validate_parallel_uploads)]
    pub parallel_uploads: Option<usize>,
    /// Upload by path reference; no file bytes traverse the wire.
    #[arg(long, action = ArgAction::SetTrue)]
    pub use_symlinks: bool,
    /// Stop after this many records in this invocation.
    #[arg(long)]
    pub limit: Option<u64>,
    /// Directory holding progress files, logs, and flags.
    #[arg(long)]
    pub run_dir: Option<PathBuf>,
}

/// Options for an archive-mode worker.
#[derive(Debug, Args)]
pub struct TarsArgs {
    /// Directory containing tar bundles.
    pub tar_dir: PathBuf,
    #[arg(long, default_value_t = 0)]
    pub shard_id: u32,
    #[arg(long, default_value_t = 1, value_parser = validators::validate_positive_u32)]
    pub shard_count: u32,
    /// Process only these archives instead of a round-robin share of the
    /// directory.
    #[arg(long = "archive")]
    pub archives: Vec<PathBuf>,
    #[arg(long, value_parser = validate_parallel_uploads)]
    pub parallel_uploads: Option<usize>,
    /// Extraction area override.
    #[arg(long)]
    pub staging_dir: Option<PathBuf>,
    /// Do not claim archives stranded by dead peers.
    #[arg(long, action = ArgAction::SetTrue)]
    pub no_orphan_recovery: bool,
    #[arg(long)]
    pub run_dir: Option<PathBuf>,
}

/// Options for the status report.
#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long)]
    pub run_dir: Option<PathBuf>,
    /// Emit machine-readable JSON instead of the table.
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,
}
