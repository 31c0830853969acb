// Exclusive per-document update handler.
//
// Each registration gets a generation number. The document observer resolves
// the current LoadState by key and generation on every update, so an observer
// left over from a replaced registration finds nothing and stays inert.
// Accepted updates go through one FIFO pump task per registration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use replica_common::{DocKey, OriginCodecError, UpdateOrigin, UpdateRecord};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use yrs::Subscription;

use crate::config::LoadFailurePolicy;
use crate::engine::conflict::ConflictDetector;
use crate::engine::degraded::DegradedModeController;
use crate::engine::ydoc::YDoc;
use crate::error::Result;
use crate::persistence::{LoadReport, PersistOutcome, PersistenceCoordinator};
use crate::telemetry::Emitter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadState {
    pub initial_load_complete: bool,
    pub updates_since_compaction: u64,
}

enum GateMessage {
    Update(UpdateRecord),
    Flush(oneshot::Sender<()>),
}

struct HandlerSlot {
    generation: u64,
    load_state: LoadState,
    queue: mpsc::UnboundedSender<GateMessage>,
}

struct GateShared {
    slots: Mutex<HashMap<DocKey, HandlerSlot>>,
    coordinator: Arc<PersistenceCoordinator>,
    degraded: Arc<DegradedModeController>,
    detector: Arc<ConflictDetector>,
    events: Emitter,
}

impl GateShared {
    fn lock(&self) -> MutexGuard<'_, HashMap<DocKey, HandlerSlot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Observer body. Runs synchronously inside the document transaction.
    fn admit(
        &self,
        doc_key: &DocKey,
        generation: u64,
        origin: std::result::Result<UpdateOrigin, OriginCodecError>,
        payload: &[u8],
    ) {
        let origin = match origin {
            Ok(origin) => origin,
            Err(error) => {
                warn!(doc_key = %doc_key, error = %error, "dropping update with unknown origin");
                return;
            }
        };

        let slots = self.lock();
        let Some(slot) = slots.get(doc_key).filter(|slot| slot.generation == generation) else {
            return;
        };
        if !slot.load_state.initial_load_complete {
            debug!(doc_key = %doc_key, origin = %origin, "dropping update before initial load");
            return;
        }
        if !origin.should_persist() {
            return;
        }

        let record = UpdateRecord::new(doc_key.clone(), payload.to_vec(), origin);
        if slot.queue.send(GateMessage::Update(record)).is_err() {
            warn!(doc_key = %doc_key, "persist queue closed, update dropped");
        }
    }

    async fn persist(&self, doc_key: &DocKey, generation: u64, mut record: UpdateRecord) {
        match self.coordinator.persist(doc_key, &mut record).await {
            Ok(PersistOutcome::Written { sequence }) => {
                self.degraded.record_success("persist");
                self.detector.acknowledge_local_write(doc_key, sequence);
                debug!(doc_key = %doc_key, origin = %record.origin, sequence = ?record.sequence, "update persisted");
                let due = {
                    let mut slots = self.lock();
                    match slots.get_mut(doc_key) {
                        Some(slot) if slot.generation == generation => {
                            slot.load_state.updates_since_compaction += 1;
                            Some(
                                self.coordinator
                                    .compaction_due(slot.load_state.updates_since_compaction),
                            )
                        }
                        Some(_) => Some(false),
                        None => None,
                    }
                };
                match due {
                    Some(true) => self.trigger_compaction(doc_key, generation),
                    Some(false) => {}
                    // Drained after deregistration.
                    None => self.coordinator.forget_document(doc_key),
                }
            }
            Ok(PersistOutcome::Suppressed) => {}
            Err(error) => {
                warn!(doc_key = %doc_key, origin = %record.origin, error = %error, "persist failed");
                self.degraded.record_failure("persist", &error);
                self.events.emit(
                    "persist_failed",
                    json!({
                        "doc_key": doc_key.as_str(),
                        "origin": record.origin.as_str(),
                        "error": error.to_string(),
                    }),
                );
            }
        }
    }

    fn trigger_compaction(&self, doc_key: &DocKey, generation: u64) {
        if !self.coordinator.schedule_compaction(doc_key) {
            return;
        }
        if let Some(slot) = self.lock().get_mut(doc_key) {
            if slot.generation == generation {
                slot.load_state.updates_since_compaction = 0;
            }
        }
    }
}

async fn pump(
    shared: Arc<GateShared>,
    doc_key: DocKey,
    generation: u64,
    mut queue: mpsc::UnboundedReceiver<GateMessage>,
) {
    while let Some(message) = queue.recv().await {
        match message {
            GateMessage::Update(record) => shared.persist(&doc_key, generation, record).await,
            GateMessage::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(doc_key = %doc_key, generation, "persist queue drained");
}

pub struct DocumentUpdateGate {
    shared: Arc<GateShared>,
    subscriptions: Mutex<HashMap<DocKey, Subscription>>,
    next_generation: AtomicU64,
}

impl DocumentUpdateGate {
    pub fn new(
        coordinator: Arc<PersistenceCoordinator>,
        degraded: Arc<DegradedModeController>,
        detector: Arc<ConflictDetector>,
        events: Emitter,
    ) -> Self {
        Self {
            shared: Arc::new(GateShared {
                slots: Mutex::new(HashMap::new()),
                coordinator,
                degraded,
                detector,
                events,
            }),
            subscriptions: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Bind the handler for `doc_key`, replacing any existing one, and return
    /// its generation. Writes stay blocked until `complete_initial_load` is
    /// called with that generation. Must run inside a tokio runtime.
    pub fn register_handler(&self, doc: &YDoc, doc_key: DocKey) -> Result<u64> {
        self.deregister_handler(&doc_key);

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let (queue, receiver) = mpsc::unbounded_channel();
        self.shared
            .lock()
            .insert(doc_key.clone(), HandlerSlot { generation, load_state: LoadState::default(), queue });

        let shared = Arc::clone(&self.shared);
        let observed_key = doc_key.clone();
        let subscription = match doc.observe_updates(move |origin, payload| {
            shared.admit(&observed_key, generation, origin, payload);
        }) {
            Ok(subscription) => subscription,
            Err(error) => {
                self.shared.lock().remove(&doc_key);
                return Err(error.into());
            }
        };
        self.subscriptions().insert(doc_key.clone(), subscription);

        tokio::spawn(pump(Arc::clone(&self.shared), doc_key.clone(), generation, receiver));
        debug!(doc_key = %doc_key, generation, "update handler registered");
        self.shared
            .events
            .emit("handler_registered", json!({ "doc_key": doc_key.as_str(), "generation": generation }));
        Ok(generation)
    }

    /// Unbind the handler and discard its LoadState. Updates already queued
    /// are still persisted. Returns `false` when nothing was registered.
    pub fn deregister_handler(&self, doc_key: &DocKey) -> bool {
        // Detach the observer first so no update can arrive mid-teardown.
        drop(self.subscriptions().remove(doc_key));
        let Some(slot) = self.shared.lock().remove(doc_key) else {
            return false;
        };
        self.shared.coordinator.forget_document(doc_key);
        debug!(doc_key = %doc_key, generation = slot.generation, "update handler deregistered");
        self.shared.events.emit(
            "handler_deregistered",
            json!({ "doc_key": doc_key.as_str(), "generation": slot.generation }),
        );
        true
    }

    /// Open the gate after the initial load. The replayed count seeds the
    /// compaction counter. A load finished for a registration that has since
    /// been replaced is ignored.
    pub fn complete_initial_load(
        &self,
        doc_key: &DocKey,
        generation: u64,
        report: &LoadReport,
        policy: LoadFailurePolicy,
    ) {
        {
            let mut slots = self.shared.lock();
            let Some(slot) = slots.get_mut(doc_key) else {
                return;
            };
            if slot.generation != generation {
                debug!(doc_key = %doc_key, generation, current = slot.generation, "ignoring load for replaced handler");
                return;
            }
            if report.failure.is_some() && policy == LoadFailurePolicy::KeepWriteBlocked {
                warn!(doc_key = %doc_key, "load failed, writes stay blocked until reopened");
                self.shared
                    .events
                    .emit("writes_blocked", json!({ "doc_key": doc_key.as_str(), "replayed": report.replayed }));
                return;
            }
            slot.load_state = LoadState { initial_load_complete: true, updates_since_compaction: report.replayed };
            if !self.shared.coordinator.compaction_due(report.replayed) {
                return;
            }
        }
        self.shared.trigger_compaction(doc_key, generation);
    }

    pub fn generation(&self, doc_key: &DocKey) -> Option<u64> {
        self.shared.lock().get(doc_key).map(|slot| slot.generation)
    }

    /// Resolves once every update queued for `doc_key` so far has been handled.
    pub async fn flush(&self, doc_key: &DocKey) -> bool {
        let (done, finished) = oneshot::channel();
        let sent = self
            .shared
            .lock()
            .get(doc_key)
            .is_some_and(|slot| slot.queue.send(GateMessage::Flush(done)).is_ok());
        sent && finished.await.is_ok()
    }

    pub fn load_state(&self, doc_key: &DocKey) -> Option<LoadState> {
        self.shared.lock().get(doc_key).map(|slot| slot.load_state)
    }

    pub fn is_registered(&self, doc_key: &DocKey) -> bool {
        self.shared.lock().contains_key(doc_key)
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<DocKey, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
