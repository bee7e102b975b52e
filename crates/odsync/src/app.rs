use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "odsync",
    version,
    about = "Mirror a remote open-data catalog to the local filesystem",
    propagate_version = true
)]
pub struct App {
    /// Configuration file (default: <state>/odsync.toml).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(alias = "r", about = "Execute a download plan")]
    Run(RunArgs),
    #[command(name = "retry-failed", about = "Re-run plan items whose artifact is missing or empty")]
    RetryFailed(PlanArgs),
    #[command(alias = "h", about = "Show recent download attempts")]
    History(HistoryArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Plan file (NDJSON, one item per line).
    pub plan: PathBuf,

    /// Report the intended first strategy per item without opening sockets.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct PlanArgs {
    /// Plan file (NDJSON, one item per line).
    pub plan: PathBuf,
}

#[derive(Debug, Args)]
pub struct HistoryArgs {
    /// How many of the most recent attempts to show.
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}
