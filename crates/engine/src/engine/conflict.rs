// Cross-replica version arbitration.
//
// Each open document carries ConflictEvidence. A remote version notice R is
// judged against the cached version C and the edit guard:
//
//   R <= C                -> stale, ignored
//   R >  C, guard Idle    -> apply, C := R once applied
//   R >  C, guard Editing -> blocked, conflict event raised, C unchanged
//
// The guard moves Idle -> Editing on every local edit and back to Idle when a
// timer for the latest edit fires. Decisions only read the current state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use replica_common::{ConflictEvent, ConflictReason, DocKey, Sequence};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::telemetry::Emitter;

const CONFLICT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditGuardState {
    Idle,
    Editing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictEvidence {
    pub cached_version: Sequence,
    pub remote_version_seen: Sequence,
    pub edit_guard: EditGuardState,
    pub last_edit_at: Option<DateTime<Utc>>,
}

impl ConflictEvidence {
    pub fn new(cached_version: Sequence) -> Self {
        Self {
            cached_version,
            remote_version_seen: cached_version,
            edit_guard: EditGuardState::Idle,
            last_edit_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteDecision {
    Stale,
    Apply,
    Block,
}

pub fn decide(evidence: &ConflictEvidence, remote_version: Sequence) -> RemoteDecision {
    if remote_version <= evidence.cached_version {
        return RemoteDecision::Stale;
    }
    match evidence.edit_guard {
        EditGuardState::Idle => RemoteDecision::Apply,
        EditGuardState::Editing => RemoteDecision::Block,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The notice was stale or already applied.
    Ignored,
    /// Caller should fetch and apply remote state, then `commit_version`.
    Apply { version: Sequence },
    Blocked(ConflictEvent),
    /// The document is not open in this replica.
    NotTracked,
}

struct Panel {
    evidence: ConflictEvidence,
    edit_epoch: u64,
    guard_timer: Option<JoinHandle<()>>,
}

struct DetectorShared {
    panels: Mutex<HashMap<DocKey, Panel>>,
    conflicts: broadcast::Sender<ConflictEvent>,
    events: Emitter,
}

impl DetectorShared {
    fn lock(&self) -> MutexGuard<'_, HashMap<DocKey, Panel>> {
        self.panels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn expire_guard(&self, doc_key: &DocKey, epoch: u64) {
        let mut panels = self.lock();
        let Some(panel) = panels.get_mut(doc_key) else {
            return;
        };
        if panel.edit_epoch != epoch {
            return;
        }
        panel.evidence.edit_guard = EditGuardState::Idle;
        panel.guard_timer = None;
        debug!(doc_key = %doc_key, "edit guard window elapsed");
    }
}

pub struct ConflictDetector {
    shared: Arc<DetectorShared>,
    guard_window: Duration,
}

impl ConflictDetector {
    pub fn new(guard_window: Duration, events: Emitter) -> Self {
        let (conflicts, _) = broadcast::channel(CONFLICT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(DetectorShared { panels: Mutex::new(HashMap::new()), conflicts, events }),
            guard_window,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConflictEvent> {
        self.shared.conflicts.subscribe()
    }

    /// Start tracking a freshly loaded document at `cached_version`.
    pub fn open_panel(&self, doc_key: &DocKey, cached_version: Sequence) {
        let mut panels = self.shared.lock();
        if let Some(previous) = panels.insert(
            doc_key.clone(),
            Panel { evidence: ConflictEvidence::new(cached_version), edit_epoch: 0, guard_timer: None },
        ) {
            if let Some(timer) = previous.guard_timer {
                timer.abort();
            }
        }
    }

    pub fn close_panel(&self, doc_key: &DocKey) {
        if let Some(panel) = self.shared.lock().remove(doc_key) {
            if let Some(timer) = panel.guard_timer {
                timer.abort();
            }
        }
    }

    pub fn evidence(&self, doc_key: &DocKey) -> Option<ConflictEvidence> {
        self.shared.lock().get(doc_key).map(|panel| panel.evidence.clone())
    }

    pub fn cached_version(&self, doc_key: &DocKey) -> Option<Sequence> {
        self.shared.lock().get(doc_key).map(|panel| panel.evidence.cached_version)
    }

    /// Enter (or extend) the edit guard. Must run inside a tokio runtime.
    pub fn record_local_edit(&self, doc_key: &DocKey) {
        let mut panels = self.shared.lock();
        let Some(panel) = panels.get_mut(doc_key) else {
            return;
        };
        panel.evidence.edit_guard = EditGuardState::Editing;
        panel.evidence.last_edit_at = Some(Utc::now());
        panel.edit_epoch += 1;
        if let Some(timer) = panel.guard_timer.take() {
            timer.abort();
        }

        let epoch = panel.edit_epoch;
        let window = self.guard_window;
        let shared = Arc::clone(&self.shared);
        let key = doc_key.clone();
        panel.guard_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            shared.expire_guard(&key, epoch);
        }));
    }

    pub fn on_remote_version(&self, doc_key: &DocKey, remote_version: Sequence) -> RemoteOutcome {
        let mut panels = self.shared.lock();
        let Some(panel) = panels.get_mut(doc_key) else {
            return RemoteOutcome::NotTracked;
        };
        let evidence = &mut panel.evidence;
        let decision = decide(evidence, remote_version);
        // A stale notice leaves the evidence untouched.
        if decision != RemoteDecision::Stale {
            evidence.remote_version_seen = evidence.remote_version_seen.max(remote_version);
        }

        match decision {
            RemoteDecision::Stale => {
                debug!(doc_key = %doc_key, remote_version, cached = evidence.cached_version, "stale remote version");
                RemoteOutcome::Ignored
            }
            RemoteDecision::Apply => RemoteOutcome::Apply { version: remote_version },
            RemoteDecision::Block => {
                let event = ConflictEvent {
                    doc_key: doc_key.clone(),
                    reason: ConflictReason::LocalEditsPending,
                    version: remote_version,
                    cached_version: evidence.cached_version,
                    detected_at: Utc::now(),
                };
                warn!(
                    doc_key = %doc_key,
                    remote_version,
                    cached = evidence.cached_version,
                    "blocked remote update: {}",
                    event.reason
                );
                self.shared.events.emit(
                    "remote_update_blocked",
                    json!({
                        "doc_key": doc_key.as_str(),
                        "reason": event.reason.to_string(),
                        "version": remote_version,
                        "cached_version": evidence.cached_version,
                    }),
                );
                // No subscribers is fine; the sink above still has the record.
                let _ = self.shared.conflicts.send(event.clone());
                RemoteOutcome::Blocked(event)
            }
        }
    }

    /// Record that remote state up to `version` is now in the document.
    pub fn commit_version(&self, doc_key: &DocKey, version: Sequence) {
        if let Some(panel) = self.shared.lock().get_mut(doc_key) {
            panel.evidence.cached_version = panel.evidence.cached_version.max(version);
        }
    }

    /// Advance past this replica's own write, but only when nothing from
    /// another replica could sit in between.
    pub fn acknowledge_local_write(&self, doc_key: &DocKey, sequence: Sequence) {
        if let Some(panel) = self.shared.lock().get_mut(doc_key) {
            if sequence == panel.evidence.cached_version + 1 {
                panel.evidence.cached_version = sequence;
            }
        }
    }
}

impl Drop for ConflictDetector {
    fn drop(&mut self) {
        for panel in self.shared.lock().values_mut() {
            if let Some(timer) = panel.guard_timer.take() {
                timer.abort();
            }
        }
    }
}
