// Structured engine events for the external log sink.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    UpdateGate,
    Persistence,
    ConflictDetector,
    DegradedMode,
    EvictionCache,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpdateGate => f.write_str("update_gate"),
            Self::Persistence => f.write_str("persistence"),
            Self::ConflictDetector => f.write_str("conflict_detector"),
            Self::DegradedMode => f.write_str("degraded_mode"),
            Self::EvictionCache => f.write_str("eviction_cache"),
        }
    }
}

/// Write-only observability record. The engine never reads these back.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineEvent {
    pub component: Component,
    pub action: String,
    pub metadata: Value,
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(component: Component, action: impl Into<String>, metadata: Value) -> Self {
        Self { component, action: action.into(), metadata, timestamp: Utc::now() }
    }
}
