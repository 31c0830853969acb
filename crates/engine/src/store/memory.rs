// In-process store. Replicas in one process share it through an `Arc`.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use replica_common::{DocKey, Sequence};

use super::{CompactionSummary, Storage, StorageError, StoredSnapshot, StoredUpdate};
use crate::engine::ydoc::merge_into_state;

#[derive(Debug, Default)]
struct DocLog {
    snapshot: Option<StoredSnapshot>,
    records: Vec<StoredUpdate>,
    head: Sequence,
}

#[derive(Debug, Default)]
struct MemoryState {
    docs: HashMap<DocKey, DocLog>,
    offline: bool,
    failures_remaining: usize,
    persist_calls: usize,
}

/// Storage held entirely in memory, with failure injection for exercising
/// degraded paths.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` storage operations fail.
    pub fn fail_next(&self, count: usize) {
        self.lock().failures_remaining = count;
    }

    /// While offline every operation, including connectivity checks, fails.
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Number of `persist` calls that reached this store, failed ones included.
    pub fn persist_calls(&self) -> usize {
        self.lock().persist_calls
    }

    /// Payloads currently in the log for `doc_key`.
    pub fn persisted_payloads(&self, doc_key: &DocKey) -> Vec<Vec<u8>> {
        self.lock()
            .docs
            .get(doc_key)
            .map(|log| log.records.iter().map(|record| record.payload.clone()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked mid-operation.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checked(&self) -> Result<MutexGuard<'_, MemoryState>, StorageError> {
        let mut state = self.lock();
        if state.offline {
            return Err(StorageError::Unavailable("memory store is offline".into()));
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(StorageError::Unavailable("injected storage failure".into()));
        }
        Ok(state)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn persist(&self, doc_key: &DocKey, payload: &[u8]) -> Result<Sequence, StorageError> {
        self.lock().persist_calls += 1;
        let mut state = self.checked()?;
        let log = state.docs.entry(doc_key.clone()).or_default();
        log.head += 1;
        let sequence = log.head;
        log.records.push(StoredUpdate { sequence, payload: payload.to_vec() });
        Ok(sequence)
    }

    async fn load(&self, doc_key: &DocKey) -> Result<Option<Vec<u8>>, StorageError> {
        let state = self.checked()?;
        let Some(log) = state.docs.get(doc_key) else {
            return Ok(None);
        };
        if log.snapshot.is_none() && log.records.is_empty() {
            return Ok(None);
        }
        let merged = merge_into_state(
            log.snapshot.as_ref().map(|snapshot| snapshot.payload.as_slice()),
            log.records.iter().map(|record| record.payload.as_slice()),
        )
        .map_err(|error| StorageError::Corrupt {
            doc_key: doc_key.clone(),
            detail: format!("{error:#}"),
        })?;
        Ok(Some(merged))
    }

    async fn load_snapshot(&self, doc_key: &DocKey) -> Result<Option<StoredSnapshot>, StorageError> {
        let state = self.checked()?;
        Ok(state.docs.get(doc_key).and_then(|log| log.snapshot.clone()))
    }

    async fn get_all_updates(&self, doc_key: &DocKey) -> Result<Vec<StoredUpdate>, StorageError> {
        let state = self.checked()?;
        Ok(state.docs.get(doc_key).map(|log| log.records.clone()).unwrap_or_default())
    }

    async fn compact(&self, doc_key: &DocKey) -> Result<CompactionSummary, StorageError> {
        let mut state = self.checked()?;
        let Some(log) = state.docs.get_mut(doc_key) else {
            return Ok(CompactionSummary { folded: 0, snapshot_sequence: 0 });
        };
        let current_snapshot = log.snapshot.as_ref().map(|snapshot| snapshot.sequence).unwrap_or(0);
        if log.records.is_empty() {
            return Ok(CompactionSummary { folded: 0, snapshot_sequence: current_snapshot });
        }

        let merged = merge_into_state(
            log.snapshot.as_ref().map(|snapshot| snapshot.payload.as_slice()),
            log.records.iter().map(|record| record.payload.as_slice()),
        )
        .map_err(|error| StorageError::Corrupt {
            doc_key: doc_key.clone(),
            detail: format!("{error:#}"),
        })?;
        let folded = log.records.len();
        let snapshot_sequence = log.head;
        log.snapshot = Some(StoredSnapshot { sequence: snapshot_sequence, payload: merged });
        log.records.clear();
        Ok(CompactionSummary { folded, snapshot_sequence })
    }

    async fn head_sequence(&self, doc_key: &DocKey) -> Result<Sequence, StorageError> {
        let state = self.checked()?;
        Ok(state.docs.get(doc_key).map(|log| log.head).unwrap_or(0))
    }

    async fn check_connectivity(&self) -> Result<(), StorageError> {
        if self.lock().offline {
            return Err(StorageError::Unavailable("memory store is offline".into()));
        }
        Ok(())
    }
}
