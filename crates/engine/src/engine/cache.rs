use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use replica_common::DocKey;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::engine::conflict::ConflictDetector;
use crate::engine::gate::DocumentUpdateGate;
use crate::engine::ydoc::YDoc;
use crate::error::{EngineError, Result};
use crate::telemetry::Emitter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheEntry {
    pub key: DocKey,
    pub last_accessed: u64,
    pub pinned: bool,
}

struct CachedDoc {
    doc: Arc<YDoc>,
    last_accessed: u64,
    pinned: bool,
}

struct CacheState {
    docs: HashMap<DocKey, CachedDoc>,
    next_lru_tick: u64,
}

impl CacheState {
    fn bump_lru_tick(&mut self) -> u64 {
        let tick = self.next_lru_tick;
        self.next_lru_tick = self.next_lru_tick.saturating_add(1);
        tick
    }

    fn lru_victim(&self) -> Option<DocKey> {
        self.docs
            .iter()
            .filter(|(_, entry)| !entry.pinned)
            .min_by_key(|(_, entry)| entry.last_accessed)
            .map(|(key, _)| key.clone())
    }
}

/// Bounded set of open documents. Sole owner of live document resources.
///
/// Releasing an entry always detaches its update handler before the document
/// reference is dropped, so no in-flight update lands in a torn-down document.
pub struct WorkspaceEvictionCache {
    capacity: usize,
    state: Mutex<CacheState>,
    gate: Arc<DocumentUpdateGate>,
    detector: Arc<ConflictDetector>,
    events: Emitter,
}

impl WorkspaceEvictionCache {
    pub fn new(
        capacity: usize,
        gate: Arc<DocumentUpdateGate>,
        detector: Arc<ConflictDetector>,
        events: Emitter,
    ) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState { docs: HashMap::new(), next_lru_tick: 1 }),
            gate,
            detector,
            events,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &DocKey) -> bool {
        self.lock().docs.contains_key(key)
    }

    /// Fetch an open document and mark it most recently used.
    pub fn get(&self, key: &DocKey) -> Option<Arc<YDoc>> {
        let mut state = self.lock();
        let tick = state.bump_lru_tick();
        let entry = state.docs.get_mut(key)?;
        entry.last_accessed = tick;
        Some(Arc::clone(&entry.doc))
    }

    pub fn keys(&self) -> Vec<DocKey> {
        let mut keys = self.lock().docs.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        keys
    }

    /// Entries ordered from least to most recently used.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries = self
            .lock()
            .docs
            .iter()
            .map(|(key, entry)| CacheEntry {
                key: key.clone(),
                last_accessed: entry.last_accessed,
                pinned: entry.pinned,
            })
            .collect::<Vec<_>>();
        entries.sort_by_key(|entry| entry.last_accessed);
        entries
    }

    pub fn pin(&self, key: &DocKey) -> bool {
        self.set_pinned(key, true)
    }

    pub fn unpin(&self, key: &DocKey) -> bool {
        self.set_pinned(key, false)
    }

    /// Free one slot when at capacity by evicting the least recently used
    /// unpinned entry. Fails when every entry is pinned.
    pub fn make_room(&self) -> Result<Option<DocKey>> {
        let victim = {
            let mut state = self.lock();
            if state.docs.len() < self.capacity {
                return Ok(None);
            }
            let Some(victim) = state.lru_victim() else {
                drop(state);
                warn!(capacity = self.capacity, "admission blocked, every open document is pinned");
                self.events.emit("admission_blocked", json!({ "capacity": self.capacity }));
                return Err(EngineError::CapacityExhausted { capacity: self.capacity });
            };
            state.docs.remove(&victim).map(|entry| (victim, entry))
        };

        let Some((key, entry)) = victim else {
            return Ok(None);
        };
        info!(doc_key = %key, last_accessed = entry.last_accessed, "evicting document");
        self.release(&key, entry, "evicted");
        Ok(Some(key))
    }

    /// Insert a loaded document, evicting at most one entry to make room.
    pub fn admit(&self, key: DocKey, doc: Arc<YDoc>) -> Result<Option<DocKey>> {
        let evicted = if self.contains(&key) { None } else { self.make_room()? };
        let mut state = self.lock();
        let last_accessed = state.bump_lru_tick();
        state.docs.insert(key.clone(), CachedDoc { doc, last_accessed, pinned: false });
        debug!(doc_key = %key, open = state.docs.len(), "document admitted");
        Ok(evicted)
    }

    /// Release `key` with the same ordering as eviction.
    pub fn close(&self, key: &DocKey) -> bool {
        let Some(entry) = self.lock().docs.remove(key) else {
            return false;
        };
        self.release(key, entry, "closed");
        true
    }

    /// Release everything, e.g. on workspace shutdown.
    pub fn clear(&self) {
        let drained = self.lock().docs.drain().collect::<Vec<_>>();
        for (key, entry) in drained {
            self.release(&key, entry, "closed");
        }
    }

    fn release(&self, key: &DocKey, entry: CachedDoc, reason: &str) {
        let handler_deregistered = self.gate.deregister_handler(key);
        self.detector.close_panel(key);
        drop(entry.doc);
        self.events.emit(
            "document_released",
            json!({
                "doc_key": key.as_str(),
                "reason": reason,
                "handler_deregistered": handler_deregistered,
            }),
        );
    }

    fn set_pinned(&self, key: &DocKey, pinned: bool) -> bool {
        let mut state = self.lock();
        let tick = state.bump_lru_tick();
        let Some(entry) = state.docs.get_mut(key) else {
            return false;
        };
        entry.pinned = pinned;
        entry.last_accessed = tick;
        true
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
