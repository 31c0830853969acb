// `replica inspect`: snapshot, log and head of one document.

use anyhow::Result;
use clap::Args;
use replica_common::{DocKey, Sequence};
use replica_engine::{FileStorage, Storage};
use serde::Serialize;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct InspectArgs {
    /// Document key.
    doc_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InspectResult {
    pub doc_key: DocKey,
    pub snapshot_sequence: Option<Sequence>,
    pub snapshot_bytes: Option<usize>,
    pub log_records: usize,
    pub log_bytes: usize,
    pub head: Sequence,
}

pub async fn run(storage: &FileStorage, args: InspectArgs, format: OutputFormat) -> Result<()> {
    let doc_key = DocKey::new(args.doc_key)?;
    let result = inspect(storage, &doc_key).await?;
    output::print_output(format, &result, format_human)?;
    Ok(())
}

pub async fn inspect(storage: &dyn Storage, doc_key: &DocKey) -> Result<InspectResult> {
    let snapshot = storage.load_snapshot(doc_key).await?;
    let updates = storage.get_all_updates(doc_key).await?;
    let head = storage.head_sequence(doc_key).await?;
    Ok(InspectResult {
        doc_key: doc_key.clone(),
        snapshot_sequence: snapshot.as_ref().map(|snapshot| snapshot.sequence),
        snapshot_bytes: snapshot.as_ref().map(|snapshot| snapshot.payload.len()),
        log_records: updates.len(),
        log_bytes: updates.iter().map(|update| update.payload.len()).sum(),
        head,
    })
}

fn format_human(result: &InspectResult) -> String {
    let snapshot = match (result.snapshot_sequence, result.snapshot_bytes) {
        (Some(sequence), Some(bytes)) => format!("seq {sequence} ({bytes} bytes)"),
        _ => "none".to_string(),
    };
    format!(
        "{}\n  snapshot: {snapshot}\n  log:      {} records ({} bytes)\n  head:     {}",
        result.doc_key, result.log_records, result.log_bytes, result.head
    )
}
