// `replica compact`: fold a document's log into a new snapshot.

use anyhow::Result;
use clap::Args;
use replica_common::{DocKey, Sequence};
use replica_engine::{FileStorage, Storage};
use serde::Serialize;
use tracing::info;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct CompactArgs {
    /// Document key.
    doc_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompactResult {
    pub doc_key: DocKey,
    pub folded: usize,
    pub snapshot_sequence: Sequence,
}

pub async fn run(storage: &FileStorage, args: CompactArgs, format: OutputFormat) -> Result<()> {
    let doc_key = DocKey::new(args.doc_key)?;
    let summary = storage.compact(&doc_key).await?;
    info!(doc_key = %doc_key, folded = summary.folded, "compacted");
    let result = CompactResult {
        doc_key,
        folded: summary.folded,
        snapshot_sequence: summary.snapshot_sequence,
    };
    output::print_output(format, &result, format_human)?;
    Ok(())
}

fn format_human(result: &CompactResult) -> String {
    if result.folded == 0 {
        return format!("{}: nothing to compact (snapshot at seq {})", result.doc_key, result.snapshot_sequence);
    }
    format!(
        "{}: folded {} records into snapshot at seq {}",
        result.doc_key, result.folded, result.snapshot_sequence
    )
}
