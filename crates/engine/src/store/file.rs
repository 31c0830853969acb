// File-backed store: per-document WAL plus snapshot under one root directory.
//
//   <root>/log/{doc_key}.wal
//   <root>/snapshots/{doc_key}.snap

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use replica_common::{DocKey, Sequence};
use tracing::{debug, warn};

use super::snapshot::SnapshotStore;
use super::wal::WalStore;
use super::{CompactionSummary, Storage, StorageError, StoredSnapshot, StoredUpdate};
use crate::engine::ydoc::merge_into_state;

/// Cheap to clone; every clone shares the same per-document locks.
#[derive(Debug, Clone)]
pub struct FileStorage {
    inner: Arc<FileStore>,
}

#[derive(Debug)]
struct FileStore {
    root: PathBuf,
    snapshots: SnapshotStore,
    docs: Mutex<HashMap<DocKey, Arc<DocState>>>,
}

#[derive(Debug, Default)]
struct DocState {
    /// Last assigned sequence, `None` until recovered from disk. Held for every
    /// read or write of this document's log.
    head: Mutex<Option<Sequence>>,
    /// One compaction per document at a time.
    compaction: Mutex<()>,
}

/// What a compaction folded before the log is shrunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Folded {
    records: usize,
    through: Sequence,
}

impl FileStorage {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("log"))
            .with_context(|| format!("failed to create log directory under `{}`", root.display()))?;
        let snapshots = SnapshotStore::new(&root)?;
        Ok(Self {
            inner: Arc::new(FileStore { root, snapshots, docs: Mutex::new(HashMap::new()) }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Run filesystem work off the async executor.
    async fn run_blocking<T, F>(&self, task: F) -> Result<T, StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&FileStore) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || task(&store))
            .await
            .map_err(|error| StorageError::Backend(anyhow!("storage task failed: {error}")))?
            .map_err(StorageError::from)
    }
}

impl FileStore {
    fn wal_for(&self, doc_key: &DocKey) -> Result<WalStore> {
        WalStore::open(self.root.join("log").join(format!("{doc_key}.wal")))
    }

    fn doc(&self, doc_key: &DocKey) -> Arc<DocState> {
        Arc::clone(lock(&self.docs).entry(doc_key.clone()).or_default())
    }

    /// Snapshot plus the log records it does not cover. Caller holds the head lock.
    fn read_doc(
        &self,
        head: &mut Option<Sequence>,
        doc_key: &DocKey,
    ) -> Result<(Option<StoredSnapshot>, Vec<StoredUpdate>, Sequence)> {
        let snapshot = self.snapshots.load_snapshot(doc_key)?;
        let (mut records, summary) = self.wal_for(doc_key)?.read_all()?;
        if summary.checksum_failed {
            warn!(doc_key = %doc_key, valid_frames = summary.valid_frames, "wal tail failed checksum and was truncated");
        }
        let folded = snapshot.as_ref().map_or(0, |snapshot| snapshot.sequence);
        // Records a finished snapshot covers may linger until the log is rewritten.
        records.retain(|record| record.sequence > folded);

        let on_disk = summary.last_sequence.unwrap_or(0).max(folded);
        let recovered = head.map_or(on_disk, |known| known.max(on_disk));
        *head = Some(recovered);
        Ok((snapshot, records, recovered))
    }

    fn head_sequence(&self, doc_key: &DocKey) -> Result<Sequence> {
        let state = self.doc(doc_key);
        let mut head = lock(&state.head);
        match *head {
            Some(known) => Ok(known),
            None => Ok(self.read_doc(&mut head, doc_key)?.2),
        }
    }

    fn persist(&self, doc_key: &DocKey, payload: &[u8]) -> Result<Sequence> {
        let state = self.doc(doc_key);
        let mut head = lock(&state.head);
        let current = match *head {
            Some(known) => known,
            None => self.read_doc(&mut head, doc_key)?.2,
        };
        let sequence = current + 1;
        self.wal_for(doc_key)?.append_update(sequence, payload)?;
        *head = Some(sequence);
        Ok(sequence)
    }

    fn contents(&self, doc_key: &DocKey) -> Result<(Option<StoredSnapshot>, Vec<StoredUpdate>)> {
        let state = self.doc(doc_key);
        let mut head = lock(&state.head);
        let (snapshot, records, _) = self.read_doc(&mut head, doc_key)?;
        Ok((snapshot, records))
    }

    fn compact(&self, doc_key: &DocKey) -> Result<CompactionSummary> {
        let state = self.doc(doc_key);
        let _compacting = lock(&state.compaction);
        match self.write_snapshot(&state, doc_key)? {
            Some(folded) => {
                self.drop_folded(&state, doc_key, folded.through)?;
                Ok(CompactionSummary { folded: folded.records, snapshot_sequence: folded.through })
            }
            None => {
                let current = self.snapshots.load_snapshot(doc_key)?.map_or(0, |s| s.sequence);
                Ok(CompactionSummary { folded: 0, snapshot_sequence: current })
            }
        }
    }

    /// Fold the current log into a new snapshot. Appends keep going meanwhile;
    /// only the read takes the head lock.
    fn write_snapshot(&self, state: &DocState, doc_key: &DocKey) -> Result<Option<Folded>> {
        let (snapshot, records, _) = {
            let mut head = lock(&state.head);
            self.read_doc(&mut head, doc_key)?
        };
        let Some(through) = records.last().map(|record| record.sequence) else {
            return Ok(None);
        };

        let merged = merge_into_state(
            snapshot.as_ref().map(|snapshot| snapshot.payload.as_slice()),
            records.iter().map(|record| record.payload.as_slice()),
        )
        .with_context(|| format!("failed to fold log for `{doc_key}`"))?;
        self.snapshots.save_snapshot(doc_key, through, &merged)?;
        Ok(Some(Folded { records: records.len(), through }))
    }

    /// Shrink the log to what arrived after `through`. The snapshot is already
    /// durable; a crash before this only leaves covered records behind.
    fn drop_folded(&self, state: &DocState, doc_key: &DocKey, through: Sequence) -> Result<()> {
        let _head = lock(&state.head);
        let dropped = self.wal_for(doc_key)?.retain_after(through)?;
        debug!(doc_key = %doc_key, through, dropped, "wal shrunk after snapshot");
        Ok(())
    }

    fn check_connectivity(&self) -> Result<(), StorageError> {
        let metadata = fs::metadata(&self.root).map_err(|error| {
            StorageError::Unavailable(format!("`{}`: {error}", self.root.display()))
        })?;
        if metadata.permissions().readonly() {
            return Err(StorageError::Unavailable(format!(
                "`{}` is read-only",
                self.root.display()
            )));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Storage for FileStorage {
    async fn persist(&self, doc_key: &DocKey, payload: &[u8]) -> Result<Sequence, StorageError> {
        let (doc_key, payload) = (doc_key.clone(), payload.to_vec());
        self.run_blocking(move |store| store.persist(&doc_key, &payload)).await
    }

    async fn load(&self, doc_key: &DocKey) -> Result<Option<Vec<u8>>, StorageError> {
        let key = doc_key.clone();
        let (snapshot, records) = self.run_blocking(move |store| store.contents(&key)).await?;
        if snapshot.is_none() && records.is_empty() {
            return Ok(None);
        }
        let merged = merge_into_state(
            snapshot.as_ref().map(|snapshot| snapshot.payload.as_slice()),
            records.iter().map(|record| record.payload.as_slice()),
        )
        .map_err(|error| StorageError::Corrupt {
            doc_key: doc_key.clone(),
            detail: format!("{error:#}"),
        })?;
        Ok(Some(merged))
    }

    async fn load_snapshot(&self, doc_key: &DocKey) -> Result<Option<StoredSnapshot>, StorageError> {
        let doc_key = doc_key.clone();
        self.run_blocking(move |store| store.snapshots.load_snapshot(&doc_key)).await
    }

    async fn get_all_updates(&self, doc_key: &DocKey) -> Result<Vec<StoredUpdate>, StorageError> {
        let doc_key = doc_key.clone();
        self.run_blocking(move |store| Ok(store.contents(&doc_key)?.1)).await
    }

    async fn compact(&self, doc_key: &DocKey) -> Result<CompactionSummary, StorageError> {
        let doc_key = doc_key.clone();
        self.run_blocking(move |store| store.compact(&doc_key)).await
    }

    async fn head_sequence(&self, doc_key: &DocKey) -> Result<Sequence, StorageError> {
        let doc_key = doc_key.clone();
        self.run_blocking(move |store| store.head_sequence(&doc_key)).await
    }

    async fn check_connectivity(&self) -> Result<(), StorageError> {
        let store = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || store.check_connectivity())
            .await
            .map_err(|error| StorageError::Backend(anyhow!("storage task failed: {error}")))?
    }
}
