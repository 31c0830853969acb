// `replica probe`: the same connectivity check and probe write that
// degraded-mode reset performs.

use anyhow::Result;
use clap::Args;
use replica_common::{DocKey, Sequence};
use replica_engine::{FileStorage, Storage, YDoc};
use serde::Serialize;

use crate::output::{self, OutputFormat};

#[derive(Debug, Args)]
pub struct ProbeArgs {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub data_dir: String,
    pub probe_key: DocKey,
    pub probe_sequence: Sequence,
}

pub async fn run(storage: &FileStorage, _args: ProbeArgs, format: OutputFormat) -> Result<()> {
    let probe_sequence = probe(storage).await?;
    let result = ProbeResult {
        data_dir: storage.root().display().to_string(),
        probe_key: DocKey::degraded_probe(),
        probe_sequence,
    };
    output::print_output(format, &result, |r| {
        format!("{} is writable (probe seq {})", r.data_dir, r.probe_sequence)
    })?;
    Ok(())
}

pub async fn probe(storage: &dyn Storage) -> Result<Sequence> {
    storage.check_connectivity().await?;
    let payload = YDoc::new().encode_state();
    Ok(storage.persist(&DocKey::degraded_probe(), &payload).await?)
}
