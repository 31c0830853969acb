// `replica export`: print one text root of a document's merged state.

use anyhow::{bail, Result};
use clap::Args;
use replica_common::{DocKey, Sequence};
use replica_engine::{FileStorage, Storage, YDoc};
use serde::Serialize;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Document key.
    doc_key: String,

    /// Name of the text root to print.
    #[arg(long, default_value = "content")]
    text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportResult {
    pub doc_key: DocKey,
    pub text_name: String,
    pub head: Sequence,
    pub text: String,
}

pub async fn run(storage: &FileStorage, args: ExportArgs, format: OutputFormat) -> Result<()> {
    let doc_key = DocKey::new(args.doc_key)?;
    let result = export(storage, &doc_key, &args.text).await?;
    output::print_output(format, &result, |r| r.text.clone())?;
    Ok(())
}

pub async fn export(storage: &dyn Storage, doc_key: &DocKey, text_name: &str) -> Result<ExportResult> {
    let Some(state) = storage.load(doc_key).await? else {
        bail!("document `{doc_key}` not found");
    };
    let doc = YDoc::from_state(&state)?;
    Ok(ExportResult {
        doc_key: doc_key.clone(),
        text_name: text_name.to_string(),
        head: storage.head_sequence(doc_key).await?,
        text: doc.get_text_string(text_name),
    })
}
