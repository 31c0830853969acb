// Persistence backends behind the `Storage` contract.

pub mod file;
pub mod memory;
pub mod snapshot;
pub mod wal;

use async_trait::async_trait;
use replica_common::{DocKey, Sequence};
use thiserror::Error;

pub use file::FileStorage;
pub use memory::MemoryStorage;

/// A log record as stored, with its storage-assigned sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpdate {
    pub sequence: Sequence,
    pub payload: Vec<u8>,
}

/// Full document state superseding every log record up to `sequence`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSnapshot {
    pub sequence: Sequence,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionSummary {
    /// Log records folded into the new snapshot.
    pub folded: usize,
    pub snapshot_sequence: Sequence,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("stored state for `{doc_key}` is corrupt: {detail}")]
    Corrupt { doc_key: DocKey, detail: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Durable store shared by every replica of a document.
///
/// Sequences are assigned here, per document, strictly increasing. Replicas
/// never pick their own.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Append `payload` to the document's log and return its sequence.
    async fn persist(&self, doc_key: &DocKey, payload: &[u8]) -> Result<Sequence, StorageError>;

    /// Snapshot and log merged into one full-state update, `None` when nothing is stored.
    async fn load(&self, doc_key: &DocKey) -> Result<Option<Vec<u8>>, StorageError>;

    async fn load_snapshot(&self, doc_key: &DocKey) -> Result<Option<StoredSnapshot>, StorageError>;

    /// Log records not yet folded into the snapshot, ascending by sequence.
    async fn get_all_updates(&self, doc_key: &DocKey) -> Result<Vec<StoredUpdate>, StorageError>;

    /// Fold snapshot and log into a new snapshot at the log head and drop the folded records.
    async fn compact(&self, doc_key: &DocKey) -> Result<CompactionSummary, StorageError>;

    async fn head_sequence(&self, doc_key: &DocKey) -> Result<Sequence, StorageError>;

    async fn check_connectivity(&self) -> Result<(), StorageError>;
}
