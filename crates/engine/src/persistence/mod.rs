// Load, persist and compact a document's durable log.
//
// The coordinator never retries. Storage errors come back to the caller as
// values; load and compaction outcomes are also counted by the degraded-mode
// controller (persist outcomes are counted by the gate's pump).

pub mod dedupe;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use replica_common::{DocKey, Sequence, UpdateOrigin, UpdateRecord};
use serde::Serialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PersistenceConfig;
use crate::engine::degraded::DegradedModeController;
use crate::engine::gate::DocumentUpdateGate;
use crate::engine::ydoc::YDoc;
use crate::store::{Storage, StorageError};
use crate::telemetry::Emitter;

use self::dedupe::{comparator_for, hex_encode, DuplicateComparator};

/// What an initial load found.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub from_snapshot: bool,
    pub snapshot_sequence: Sequence,
    /// Log records applied on top of the snapshot (or from scratch).
    pub replayed: u64,
    /// Highest sequence whose content is now in the document.
    pub head: Sequence,
    /// Set when the load stopped part-way.
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Written { sequence: Sequence },
    /// Not written: a consecutive duplicate or a replayed update.
    Suppressed,
}

pub struct PersistenceCoordinator {
    storage: Arc<dyn Storage>,
    config: PersistenceConfig,
    comparator: Option<Box<dyn DuplicateComparator>>,
    last_fingerprint: Mutex<HashMap<DocKey, Vec<u8>>>,
    compactions: Mutex<HashMap<DocKey, JoinHandle<()>>>,
    degraded: Arc<DegradedModeController>,
    events: Emitter,
}

impl PersistenceCoordinator {
    pub fn new(
        storage: Arc<dyn Storage>,
        config: PersistenceConfig,
        degraded: Arc<DegradedModeController>,
        events: Emitter,
    ) -> Self {
        let comparator = comparator_for(config.duplicate_check);
        Self {
            storage,
            config,
            comparator,
            last_fingerprint: Mutex::new(HashMap::new()),
            compactions: Mutex::new(HashMap::new()),
            degraded,
            events,
        }
    }

    pub fn config(&self) -> &PersistenceConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Compaction is due once strictly more than `compact_threshold` updates
    /// accumulated.
    pub fn compaction_due(&self, updates_since_compaction: u64) -> bool {
        updates_since_compaction > self.config.compact_threshold
    }

    /// Populate `doc` from storage and hand the result to the gate handler
    /// registered as `generation`, which decides whether writes are now
    /// accepted. Always completes the load, even when storage failed part-way.
    pub async fn load_document(
        &self,
        gate: &DocumentUpdateGate,
        doc_key: &DocKey,
        generation: u64,
        doc: &YDoc,
    ) -> LoadReport {
        let mut report = LoadReport::default();
        match self.replay_into(doc_key, doc, &mut report).await {
            Ok(()) => {
                self.degraded.record_success("load_document");
                info!(
                    doc_key = %doc_key,
                    from_snapshot = report.from_snapshot,
                    replayed = report.replayed,
                    head = report.head,
                    "document loaded"
                );
                self.events.emit(
                    "document_loaded",
                    json!({
                        "doc_key": doc_key.as_str(),
                        "from_snapshot": report.from_snapshot,
                        "snapshot_sequence": report.snapshot_sequence,
                        "replayed": report.replayed,
                        "head": report.head,
                    }),
                );
            }
            Err(error) => {
                warn!(doc_key = %doc_key, replayed = report.replayed, error = %error, "document load failed");
                self.degraded.record_failure("load_document", &error);
                self.events.emit(
                    "load_failed",
                    json!({
                        "doc_key": doc_key.as_str(),
                        "replayed": report.replayed,
                        "error": error.to_string(),
                        "policy": self.config.load_failure_policy,
                    }),
                );
                report.failure = Some(error.to_string());
            }
        }
        gate.complete_initial_load(doc_key, generation, &report, self.config.load_failure_policy);
        report
    }

    async fn replay_into(
        &self,
        doc_key: &DocKey,
        doc: &YDoc,
        report: &mut LoadReport,
    ) -> Result<(), StorageError> {
        let mut applied = 0;
        if let Some(snapshot) = self.storage.load_snapshot(doc_key).await? {
            apply_stored(doc_key, doc, &snapshot.payload)?;
            applied = snapshot.sequence;
            report.head = snapshot.sequence;
            if self.config.load_snapshots {
                report.from_snapshot = true;
                report.snapshot_sequence = snapshot.sequence;
            } else {
                // The folded prefix only survives in the snapshot; count it as one record.
                report.replayed += 1;
            }
        }

        for record in self.storage.get_all_updates(doc_key).await? {
            if record.sequence <= applied {
                continue;
            }
            apply_stored(doc_key, doc, &record.payload)?;
            applied = record.sequence;
            report.head = record.sequence;
            report.replayed += 1;
        }
        Ok(())
    }

    /// Append `record` to the durable log unless it must not be written. On
    /// success the storage-assigned sequence is recorded on `record`.
    pub async fn persist(
        &self,
        doc_key: &DocKey,
        record: &mut UpdateRecord,
    ) -> Result<PersistOutcome, StorageError> {
        if !record.origin.should_persist() {
            warn!(doc_key = %doc_key, origin = %record.origin, "refusing to persist a replayed update");
            return Ok(PersistOutcome::Suppressed);
        }

        if let Some(comparator) = &self.comparator {
            let duplicate = self
                .fingerprints()
                .get(doc_key)
                .is_some_and(|previous| comparator.is_duplicate(previous, &record.payload));
            if duplicate {
                debug!(doc_key = %doc_key, bytes = record.payload.len(), "suppressed duplicate update");
                return Ok(PersistOutcome::Suppressed);
            }
        }

        let sequence = self.storage.persist(doc_key, &record.payload).await?;
        record.sequence = Some(sequence);
        if let Some(comparator) = &self.comparator {
            let fingerprint = comparator.fingerprint(&record.payload);
            debug!(doc_key = %doc_key, sequence, fingerprint = %hex_encode(&fingerprint), "persisted update");
            self.fingerprints().insert(doc_key.clone(), fingerprint);
        }
        Ok(PersistOutcome::Written { sequence })
    }

    /// Start a background compaction for `doc_key`. Returns `false` while a
    /// previous one is still running.
    pub fn schedule_compaction(&self, doc_key: &DocKey) -> bool {
        let mut compactions = self.compactions();
        if compactions.get(doc_key).is_some_and(|running| !running.is_finished()) {
            debug!(doc_key = %doc_key, "compaction already in flight");
            return false;
        }

        let storage = Arc::clone(&self.storage);
        let degraded = Arc::clone(&self.degraded);
        let events = self.events.clone();
        let key = doc_key.clone();
        let task = tokio::spawn(async move {
            match storage.compact(&key).await {
                Ok(summary) => {
                    degraded.record_success("compact");
                    info!(
                        doc_key = %key,
                        folded = summary.folded,
                        snapshot_sequence = summary.snapshot_sequence,
                        "compaction finished"
                    );
                    events.emit(
                        "compaction_finished",
                        json!({
                            "doc_key": key.as_str(),
                            "folded": summary.folded,
                            "snapshot_sequence": summary.snapshot_sequence,
                        }),
                    );
                }
                Err(error) => {
                    warn!(doc_key = %key, error = %error, "compaction failed");
                    degraded.record_failure("compact", &error);
                    events.emit(
                        "compaction_failed",
                        json!({ "doc_key": key.as_str(), "error": error.to_string() }),
                    );
                }
            }
        });
        compactions.insert(doc_key.clone(), task);
        drop(compactions);

        self.events.emit("compaction_scheduled", json!({ "doc_key": doc_key.as_str() }));
        true
    }

    /// Wait for the most recent compaction of `doc_key`, if any.
    pub async fn wait_for_compaction(&self, doc_key: &DocKey) -> bool {
        let Some(task) = self.compactions().remove(doc_key) else {
            return false;
        };
        if let Err(error) = task.await {
            warn!(doc_key = %doc_key, error = %error, "compaction task ended abnormally");
        }
        true
    }

    /// Apply stored state newer than `after` to an already loaded document.
    /// Returns the highest sequence now in the document.
    pub async fn catch_up(
        &self,
        doc_key: &DocKey,
        doc: &YDoc,
        after: Sequence,
    ) -> Result<Sequence, StorageError> {
        let mut applied = after;
        if let Some(snapshot) = self.storage.load_snapshot(doc_key).await? {
            if snapshot.sequence > applied {
                apply_stored(doc_key, doc, &snapshot.payload)?;
                applied = snapshot.sequence;
            }
        }
        for record in self.storage.get_all_updates(doc_key).await? {
            if record.sequence > applied {
                apply_stored(doc_key, doc, &record.payload)?;
                applied = record.sequence;
            }
        }
        debug!(doc_key = %doc_key, after, applied, "caught up with storage");
        Ok(applied)
    }

    /// Drop the duplicate-check state kept for `doc_key`.
    pub fn forget_document(&self, doc_key: &DocKey) {
        self.fingerprints().remove(doc_key);
    }

    /// Documents with a remembered last-write fingerprint.
    pub fn tracked_documents(&self) -> usize {
        self.fingerprints().len()
    }

    fn fingerprints(&self) -> MutexGuard<'_, HashMap<DocKey, Vec<u8>>> {
        self.last_fingerprint.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn compactions(&self) -> MutexGuard<'_, HashMap<DocKey, JoinHandle<()>>> {
        self.compactions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn apply_stored(doc_key: &DocKey, doc: &YDoc, payload: &[u8]) -> Result<(), StorageError> {
    doc.apply_update_with_origin(payload, UpdateOrigin::PersistenceReplay).map_err(|error| {
        StorageError::Corrupt { doc_key: doc_key.clone(), detail: format!("{error:#}") }
    })
}
