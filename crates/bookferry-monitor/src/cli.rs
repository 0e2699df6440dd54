use std::path::PathBuf;

use clap::{ArgAction, Parser};

/// Supervisor for bookferry migration workers.
#[derive(Debug, Parser)]
#[command(name = "bookferry-monitor", version, author)]
pub struct Cli {
    /// Seconds between supervision passes.
    #[arg(long)]
    pub check_interval: Option<u64>,
    /// Minutes without uploads before a worker counts as stuck.
    #[arg(long)]
    pub threshold: Option<u64>,
    /// Consult the advisory oracle for stuck workers.
    #[arg(long, action = ArgAction::SetTrue)]
    pub llm_enabled: bool,
    /// Detect and log, but apply nothing.
    #[arg(long, action = ArgAction::SetTrue)]
    pub dry_run: bool,
    /// Directory holding progress files, logs, and flags.
    #[arg(long)]
    pub run_dir: Option<PathBuf>,
    /// Device to sample for utilization (e.g. `sda`); autodetected if unset.
    #[arg(long)]
    pub device: Option<String>,
    /// Increase logging verbosity (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
