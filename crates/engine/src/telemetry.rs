// Structured event sinks.

use std::sync::{Arc, Mutex};

use replica_common::{Component, EngineEvent};
use serde_json::Value;
use tracing::info;

/// External log sink for engine events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Forwards every event to `tracing` at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: EngineEvent) {
        info!(
            target: "replica::events",
            component = %event.component,
            action = %event.action,
            metadata = %event.metadata,
            timestamp = %event.timestamp.to_rfc3339(),
            "engine event"
        );
    }
}

/// Keeps events in emission order.
#[derive(Debug, Default)]
pub struct MemoryEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    /// `(component, action)` pairs in emission order.
    pub fn actions(&self) -> Vec<(Component, String)> {
        self.events().into_iter().map(|event| (event.component, event.action)).collect()
    }
}

impl EventSink for MemoryEventSink {
    fn emit(&self, event: EngineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

/// Cloneable handle that stamps events for one component.
#[derive(Clone)]
pub struct Emitter {
    component: Component,
    sink: Arc<dyn EventSink>,
}

impl Emitter {
    pub fn new(component: Component, sink: Arc<dyn EventSink>) -> Self {
        Self { component, sink }
    }

    pub fn emit(&self, action: &str, metadata: Value) {
        self.sink.emit(EngineEvent::new(self.component, action, metadata));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn emitter_stamps_component_and_preserves_order() {
        let sink = Arc::new(MemoryEventSink::new());
        let gate = Emitter::new(Component::UpdateGate, sink.clone());
        let cache = Emitter::new(Component::EvictionCache, sink.clone());

        gate.emit("handler_deregistered", json!({ "doc_key": "a" }));
        cache.emit("document_released", json!({ "doc_key": "a" }));

        assert_eq!(
            sink.actions(),
            vec![
                (Component::UpdateGate, "handler_deregistered".to_string()),
                (Component::EvictionCache, "document_released".to_string()),
            ]
        );
        assert_eq!(sink.events()[0].metadata["doc_key"], json!("a"));
    }
}
