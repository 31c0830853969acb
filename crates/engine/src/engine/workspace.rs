// One replica's view of the document store: the five components wired
// together. A process hosting several replicas creates several workspaces
// over one shared `Storage`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use replica_common::{Component, ConflictEvent, DocKey, Sequence, UpdateOrigin};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::engine::cache::{CacheEntry, WorkspaceEvictionCache};
use crate::engine::conflict::{ConflictDetector, ConflictEvidence, RemoteOutcome};
use crate::engine::degraded::{DegradedModeController, FailureCounter};
use crate::engine::gate::{DocumentUpdateGate, LoadState};
use crate::engine::ydoc::YDoc;
use crate::error::{EngineError, Result};
use crate::persistence::{LoadReport, PersistenceCoordinator};
use crate::store::Storage;
use crate::telemetry::{Emitter, EventSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Already open; nothing was read from storage.
    Cached,
    Loaded { report: LoadReport, evicted: Option<DocKey> },
}

pub struct Workspace {
    replica_id: Uuid,
    storage: Arc<dyn Storage>,
    coordinator: Arc<PersistenceCoordinator>,
    gate: Arc<DocumentUpdateGate>,
    detector: Arc<ConflictDetector>,
    degraded: Arc<DegradedModeController>,
    cache: WorkspaceEvictionCache,
    /// One lock per key with an open in progress.
    opening: Mutex<HashMap<DocKey, Arc<AsyncMutex<()>>>>,
}

impl Workspace {
    pub fn new(config: &EngineConfig, storage: Arc<dyn Storage>, sink: Arc<dyn EventSink>) -> Self {
        let emitter = |component| Emitter::new(component, Arc::clone(&sink));
        let degraded = Arc::new(DegradedModeController::new(
            config.degraded.failure_threshold,
            emitter(Component::DegradedMode),
        ));
        let coordinator = Arc::new(PersistenceCoordinator::new(
            Arc::clone(&storage),
            config.persistence.clone(),
            Arc::clone(&degraded),
            emitter(Component::Persistence),
        ));
        let detector = Arc::new(ConflictDetector::new(
            config.conflict.guard_window(),
            emitter(Component::ConflictDetector),
        ));
        let gate = Arc::new(DocumentUpdateGate::new(
            Arc::clone(&coordinator),
            Arc::clone(&degraded),
            Arc::clone(&detector),
            emitter(Component::UpdateGate),
        ));
        let cache = WorkspaceEvictionCache::new(
            config.cache.capacity,
            Arc::clone(&gate),
            Arc::clone(&detector),
            emitter(Component::EvictionCache),
        );

        let replica_id = Uuid::new_v4();
        info!(%replica_id, capacity = cache.capacity(), "workspace created");
        Self {
            replica_id,
            storage,
            coordinator,
            gate,
            detector,
            degraded,
            cache,
            opening: Mutex::new(HashMap::new()),
        }
    }

    pub fn replica_id(&self) -> Uuid {
        self.replica_id
    }

    /// Open `doc_key`, loading it from storage unless it is already hot.
    /// Rejected while degraded or when every open document is pinned.
    /// Concurrent opens of one key share a single load.
    pub async fn open_document(&self, doc_key: &DocKey) -> Result<OpenOutcome> {
        if self.cache.get(doc_key).is_some() {
            return Ok(OpenOutcome::Cached);
        }

        let slot = {
            let mut opening = self.opening();
            Arc::clone(opening.entry(doc_key.clone()).or_default())
        };
        let outcome = {
            let _open = slot.lock().await;
            self.open_exclusive(doc_key).await
        };
        let mut opening = self.opening();
        // Map entry plus ours: nobody else is waiting on this key.
        if Arc::strong_count(&slot) == 2 {
            opening.remove(doc_key);
        }
        outcome
    }

    async fn open_exclusive(&self, doc_key: &DocKey) -> Result<OpenOutcome> {
        if self.cache.get(doc_key).is_some() {
            return Ok(OpenOutcome::Cached);
        }
        self.degraded.ensure_operational("open_document")?;
        let made_room = self.cache.make_room()?;

        let doc = Arc::new(YDoc::new());
        let generation = self.gate.register_handler(&doc, doc_key.clone())?;
        let report = self.coordinator.load_document(&self.gate, doc_key, generation, &doc).await;
        self.detector.open_panel(doc_key, report.head);

        let evicted = match self.cache.admit(doc_key.clone(), doc) {
            Ok(evicted) => made_room.or(evicted),
            Err(error) => {
                self.gate.deregister_handler(doc_key);
                self.detector.close_panel(doc_key);
                return Err(error);
            }
        };
        info!(
            replica_id = %self.replica_id,
            doc_key = %doc_key,
            generation,
            head = report.head,
            failed = report.failure.is_some(),
            "document opened"
        );
        Ok(OpenOutcome::Loaded { report, evicted })
    }

    pub fn close_document(&self, doc_key: &DocKey) -> bool {
        self.cache.close(doc_key)
    }

    pub fn pin(&self, doc_key: &DocKey) -> bool {
        self.cache.pin(doc_key)
    }

    pub fn unpin(&self, doc_key: &DocKey) -> bool {
        self.cache.unpin(doc_key)
    }

    /// A local edit: persisted through the gate and arms the edit guard.
    pub fn insert_text(&self, doc_key: &DocKey, name: &str, index: u32, content: &str) -> Result<()> {
        let doc = self.document(doc_key)?;
        doc.insert_text_with_origin(name, index, content, UpdateOrigin::Local);
        self.detector.record_local_edit(doc_key);
        Ok(())
    }

    /// Apply bytes received from the external sync channel.
    pub fn apply_remote_update(&self, doc_key: &DocKey, payload: &[u8]) -> Result<()> {
        let doc = self.document(doc_key)?;
        doc.apply_update_with_origin(payload, UpdateOrigin::Remote)?;
        Ok(())
    }

    /// Handle a notice that storage holds `remote_version` for `doc_key`.
    pub async fn on_remote_version(
        &self,
        doc_key: &DocKey,
        remote_version: Sequence,
    ) -> Result<RemoteOutcome> {
        let outcome = self.detector.on_remote_version(doc_key, remote_version);
        let RemoteOutcome::Apply { version } = outcome else {
            return Ok(outcome);
        };

        let doc = self.document(doc_key)?;
        let cached = self.detector.cached_version(doc_key).unwrap_or_default();
        match self.coordinator.catch_up(doc_key, &doc, cached).await {
            Ok(applied) => {
                self.degraded.record_success("catch_up");
                self.detector.commit_version(doc_key, version);
                info!(doc_key = %doc_key, version, applied, "applied remote version");
                Ok(outcome)
            }
            Err(error) => {
                warn!(doc_key = %doc_key, version, error = %error, "catch-up failed");
                self.degraded.record_failure("catch_up", &error);
                Err(error.into())
            }
        }
    }

    /// Re-check every open document against storage after the replica was
    /// in the background. A document whose check fails is left out of the
    /// result.
    pub async fn on_visibility_regained(&self) -> Vec<(DocKey, RemoteOutcome)> {
        let mut outcomes = Vec::new();
        for doc_key in self.cache.keys() {
            let head = match self.storage.head_sequence(&doc_key).await {
                Ok(head) => head,
                Err(error) => {
                    warn!(doc_key = %doc_key, error = %error, "version re-check failed");
                    self.degraded.record_failure("head_sequence", &error);
                    continue;
                }
            };
            // Failures were already logged and counted; the rest still get checked.
            match self.on_remote_version(&doc_key, head).await {
                Ok(outcome) => outcomes.push((doc_key, outcome)),
                Err(error) => {
                    debug!(doc_key = %doc_key, error = %error, "skipping document after failed catch-up");
                }
            }
        }
        outcomes
    }

    /// Wait until every update queued for `doc_key` has been handled.
    pub async fn flush(&self, doc_key: &DocKey) -> bool {
        self.gate.flush(doc_key).await
    }

    pub async fn wait_for_compaction(&self, doc_key: &DocKey) -> bool {
        self.coordinator.wait_for_compaction(doc_key).await
    }

    pub fn subscribe_conflicts(&self) -> broadcast::Receiver<ConflictEvent> {
        self.detector.subscribe()
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_degraded()
    }

    pub fn failure_counter(&self) -> FailureCounter {
        self.degraded.counter()
    }

    pub async fn reset_degraded_mode(&self) -> Result<()> {
        self.degraded.reset(self.storage.as_ref()).await
    }

    pub fn cached_version(&self, doc_key: &DocKey) -> Option<Sequence> {
        self.detector.cached_version(doc_key)
    }

    pub fn conflict_evidence(&self, doc_key: &DocKey) -> Option<ConflictEvidence> {
        self.detector.evidence(doc_key)
    }

    pub fn load_state(&self, doc_key: &DocKey) -> Option<LoadState> {
        self.gate.load_state(doc_key)
    }

    pub fn document_text(&self, doc_key: &DocKey, name: &str) -> Result<String> {
        Ok(self.document(doc_key)?.get_text_string(name))
    }

    pub fn open_documents(&self) -> Vec<CacheEntry> {
        self.cache.entries()
    }

    fn opening(&self) -> MutexGuard<'_, HashMap<DocKey, Arc<AsyncMutex<()>>>> {
        self.opening.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn document(&self, doc_key: &DocKey) -> Result<Arc<YDoc>> {
        self.cache.get(doc_key).ok_or_else(|| EngineError::NotOpen(doc_key.clone()))
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::store::{CompactionSummary, MemoryStorage, StorageError, StoredSnapshot, StoredUpdate};
    use crate::telemetry::MemoryEventSink;

    fn key(name: &str) -> DocKey {
        DocKey::new(name).expect("valid doc key")
    }

    fn workspace(storage: Arc<MemoryStorage>) -> Workspace {
        Workspace::new(&EngineConfig::default(), storage, Arc::new(MemoryEventSink::new()))
    }

    /// Memory store whose snapshot reads can be slowed down or broken per key.
    #[derive(Default)]
    struct ScriptedStorage {
        inner: MemoryStorage,
        snapshot_yields: AtomicUsize,
        broken: Mutex<Option<DocKey>>,
    }

    #[async_trait]
    impl Storage for ScriptedStorage {
        async fn persist(&self, doc_key: &DocKey, payload: &[u8]) -> std::result::Result<Sequence, StorageError> {
            self.inner.persist(doc_key, payload).await
        }

        async fn load(&self, doc_key: &DocKey) -> std::result::Result<Option<Vec<u8>>, StorageError> {
            self.inner.load(doc_key).await
        }

        async fn load_snapshot(
            &self,
            doc_key: &DocKey,
        ) -> std::result::Result<Option<StoredSnapshot>, StorageError> {
            for _ in 0..self.snapshot_yields.swap(0, Ordering::SeqCst) {
                tokio::task::yield_now().await;
            }
            let broken = self.broken.lock().unwrap().as_ref() == Some(doc_key);
            if broken {
                return Err(StorageError::Unavailable("snapshot read failed".into()));
            }
            self.inner.load_snapshot(doc_key).await
        }

        async fn get_all_updates(
            &self,
            doc_key: &DocKey,
        ) -> std::result::Result<Vec<StoredUpdate>, StorageError> {
            self.inner.get_all_updates(doc_key).await
        }

        async fn compact(&self, doc_key: &DocKey) -> std::result::Result<CompactionSummary, StorageError> {
            self.inner.compact(doc_key).await
        }

        async fn head_sequence(&self, doc_key: &DocKey) -> std::result::Result<Sequence, StorageError> {
            self.inner.head_sequence(doc_key).await
        }

        async fn check_connectivity(&self) -> std::result::Result<(), StorageError> {
            self.inner.check_connectivity().await
        }
    }

    fn text_state(content: &str) -> Vec<u8> {
        let doc = YDoc::new();
        doc.insert_text_with_origin("content", 0, content, UpdateOrigin::Local);
        doc.encode_state()
    }

    #[tokio::test]
    async fn overlapping_opens_share_one_live_handler() {
        let storage = Arc::new(ScriptedStorage::default());
        storage.snapshot_yields.store(10, Ordering::SeqCst);
        let ws = Workspace::new(&EngineConfig::default(), storage.clone(), Arc::new(MemoryEventSink::new()));
        let doc_key = key("note-1");

        let (first, second) = tokio::join!(ws.open_document(&doc_key), ws.open_document(&doc_key));
        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| matches!(o, OpenOutcome::Loaded { .. })).count(), 1);
        assert!(outcomes.contains(&OpenOutcome::Cached));
        assert!(ws.opening().is_empty());

        ws.insert_text(&doc_key, "content", 0, "hello").unwrap();
        assert!(ws.flush(&doc_key).await);
        assert_eq!(storage.inner.persist_calls(), 1);
        assert!(ws.load_state(&doc_key).unwrap().initial_load_complete);
    }

    #[tokio::test]
    async fn failed_catch_up_does_not_stop_recheck_of_other_documents() {
        let storage = Arc::new(ScriptedStorage::default());
        let ws = Workspace::new(&EngineConfig::default(), storage.clone(), Arc::new(MemoryEventSink::new()));
        let (broken, healthy) = (key("a-broken"), key("b-healthy"));
        ws.open_document(&broken).await.unwrap();
        ws.open_document(&healthy).await.unwrap();

        storage.inner.persist(&broken, &text_state("elsewhere")).await.unwrap();
        storage.inner.persist(&healthy, &text_state("elsewhere")).await.unwrap();
        *storage.broken.lock().unwrap() = Some(broken.clone());

        let outcomes = ws.on_visibility_regained().await;
        assert_eq!(outcomes, vec![(healthy.clone(), RemoteOutcome::Apply { version: 1 })]);
        assert_eq!(ws.cached_version(&healthy), Some(1));
        // Checked, but not applied.
        let evidence = ws.conflict_evidence(&broken).unwrap();
        assert_eq!((evidence.cached_version, evidence.remote_version_seen), (0, 1));
    }

    #[tokio::test]
    async fn stale_notice_after_own_write_changes_nothing() {
        let ws = workspace(Arc::new(MemoryStorage::new()));
        let doc_key = key("note-1");
        ws.open_document(&doc_key).await.unwrap();
        ws.insert_text(&doc_key, "content", 0, "mine").unwrap();
        ws.flush(&doc_key).await;

        let before = ws.conflict_evidence(&doc_key).unwrap();
        assert_eq!(before.cached_version, 1);
        assert_eq!(ws.on_remote_version(&doc_key, 1).await.unwrap(), RemoteOutcome::Ignored);
        assert_eq!(ws.conflict_evidence(&doc_key).unwrap(), before);
    }

    #[tokio::test]
    async fn edits_survive_close_and_reopen() {
        let storage = Arc::new(MemoryStorage::new());
        let ws = workspace(storage.clone());
        let doc_key = key("note-1");

        assert!(matches!(ws.open_document(&doc_key).await.unwrap(), OpenOutcome::Loaded { .. }));
        assert_eq!(ws.open_document(&doc_key).await.unwrap(), OpenOutcome::Cached);
        ws.insert_text(&doc_key, "content", 0, "hello").unwrap();
        assert!(ws.flush(&doc_key).await);
        assert_eq!(ws.cached_version(&doc_key), Some(1));

        assert!(ws.close_document(&doc_key));
        assert!(matches!(ws.document_text(&doc_key, "content"), Err(EngineError::NotOpen(_))));

        let OpenOutcome::Loaded { report, .. } = ws.open_document(&doc_key).await.unwrap() else {
            panic!("reopen must load from storage");
        };
        assert_eq!(report.replayed, 1);
        assert_eq!(ws.document_text(&doc_key, "content").unwrap(), "hello");
        assert_eq!(storage.persist_calls(), 1);
    }

    #[tokio::test]
    async fn remote_updates_apply_and_persist() {
        let storage = Arc::new(MemoryStorage::new());
        let ws = workspace(storage.clone());
        let doc_key = key("note-1");
        ws.open_document(&doc_key).await.unwrap();

        let peer = YDoc::new();
        peer.insert_text_with_origin("content", 0, "from peer", UpdateOrigin::Local);
        ws.apply_remote_update(&doc_key, &peer.encode_state()).unwrap();
        ws.flush(&doc_key).await;

        assert_eq!(ws.document_text(&doc_key, "content").unwrap(), "from peer");
        assert_eq!(storage.persisted_payloads(&doc_key).len(), 1);
        assert_eq!(
            ws.conflict_evidence(&doc_key).unwrap().edit_guard,
            crate::engine::conflict::EditGuardState::Idle
        );
    }

    #[tokio::test]
    async fn operations_on_unopened_documents_fail() {
        let ws = workspace(Arc::new(MemoryStorage::new()));
        let doc_key = key("never-opened");
        assert!(matches!(ws.insert_text(&doc_key, "content", 0, "x"), Err(EngineError::NotOpen(_))));
        assert_eq!(ws.on_remote_version(&doc_key, 3).await.unwrap(), RemoteOutcome::NotTracked);
        assert!(!ws.flush(&doc_key).await);
    }
}
