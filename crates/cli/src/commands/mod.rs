// CLI subcommand dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use replica_engine::config::EngineConfig;
use replica_engine::FileStorage;
use tracing::debug;

use crate::output::OutputFormat;

pub mod compact;
pub mod export;
pub mod inspect;
pub mod probe;

#[derive(Subcommand)]
pub enum Command {
    /// Show snapshot, log and head sequence for a document
    Inspect(inspect::InspectArgs),
    /// Fold a document's log into a new snapshot
    Compact(compact::CompactArgs),
    /// Check connectivity and perform a probe write
    Probe(probe::ProbeArgs),
    /// Print a text root of a document's merged state
    Export(export::ExportArgs),
}

pub async fn run(cmd: Command, data_dir: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let storage = open_store(data_dir)?;
    match cmd {
        Command::Inspect(args) => inspect::run(&storage, args, format).await,
        Command::Compact(args) => compact::run(&storage, args, format).await,
        Command::Probe(args) => probe::run(&storage, args, format).await,
        Command::Export(args) => export::run(&storage, args, format).await,
    }
}

/// Open the store at `--data-dir`, else the configured or default location.
fn open_store(data_dir: Option<PathBuf>) -> Result<FileStorage> {
    let root = match data_dir {
        Some(dir) => dir,
        None => EngineConfig::load()
            .data_dir()
            .context("cannot resolve a home directory; pass --data-dir")?,
    };
    debug!(root = %root.display(), "opening store");
    FileStorage::open(&root)
}
