use replica_common::DocKey;
use thiserror::Error;

use crate::store::StorageError;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Persistence is unreliable; the caller should tell the user instead of retrying.
    #[error(
        "DEGRADED: {operation} rejected, persistence failed {consecutive_failures} times in a row"
    )]
    Degraded { operation: &'static str, consecutive_failures: u32 },

    /// Every cached document is pinned. Not a persistence failure.
    #[error("CACHE_FULL: all {capacity} open documents are pinned")]
    CapacityExhausted { capacity: usize },

    #[error("document `{0}` is not open")]
    NotOpen(DocKey),

    #[error("degraded-mode probe failed: {0}")]
    ProbeFailed(#[source] StorageError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crdt(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
