// Circuit breaker over persistence outcomes.
//
//   Normal --(N consecutive failures)--> Degraded
//   Degraded --(reset: connectivity + probe write ok)--> Normal
//
// While degraded, successes do not clear the streak and failures keep counting.

use std::fmt::Display;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use replica_common::DocKey;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::engine::ydoc::YDoc;
use crate::error::{EngineError, Result};
use crate::store::Storage;
use crate::telemetry::Emitter;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureCounter {
    pub consecutive_failures: u32,
    pub degraded: bool,
    pub degraded_since: Option<DateTime<Utc>>,
}

pub struct DegradedModeController {
    threshold: u32,
    state: Mutex<FailureCounter>,
    events: Emitter,
}

impl DegradedModeController {
    pub fn new(failure_threshold: u32, events: Emitter) -> Self {
        Self {
            threshold: failure_threshold.max(1),
            state: Mutex::new(FailureCounter {
                consecutive_failures: 0,
                degraded: false,
                degraded_since: None,
            }),
            events,
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded
    }

    pub fn counter(&self) -> FailureCounter {
        self.lock().clone()
    }

    pub fn record_success(&self, operation: &str) {
        let mut state = self.lock();
        if state.degraded || state.consecutive_failures == 0 {
            return;
        }
        info!(operation, cleared = state.consecutive_failures, "persistence recovered");
        state.consecutive_failures = 0;
    }

    pub fn record_failure(&self, operation: &str, error: &dyn Display) {
        let mut state = self.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        warn!(
            operation,
            consecutive_failures = state.consecutive_failures,
            error = %error,
            "persistence failure"
        );
        if !state.degraded && state.consecutive_failures >= self.threshold {
            let now = Utc::now();
            state.degraded = true;
            state.degraded_since = Some(now);
            warn!(threshold = self.threshold, "entering degraded mode");
            self.events.emit(
                "entered_degraded",
                json!({
                    "operation": operation,
                    "consecutive_failures": state.consecutive_failures,
                    "degraded_since": now.to_rfc3339(),
                }),
            );
        }
    }

    /// Reject `operation` while degraded so the caller can surface it.
    pub fn ensure_operational(&self, operation: &'static str) -> Result<()> {
        let state = self.lock();
        if state.degraded {
            self.events.emit(
                "operation_rejected",
                json!({ "operation": operation, "consecutive_failures": state.consecutive_failures }),
            );
            return Err(EngineError::Degraded {
                operation,
                consecutive_failures: state.consecutive_failures,
            });
        }
        Ok(())
    }

    /// User-triggered recovery. Verifies connectivity, then performs a probe
    /// write; only a successful probe returns to normal. Nothing happens when
    /// not degraded.
    pub async fn reset(&self, storage: &dyn Storage) -> Result<()> {
        if !self.is_degraded() {
            return Ok(());
        }

        let probe_key = DocKey::degraded_probe();
        let probe_payload = YDoc::new().encode_state();
        let probe = async {
            storage.check_connectivity().await?;
            storage.persist(&probe_key, &probe_payload).await
        };
        match probe.await {
            Ok(sequence) => {
                let mut state = self.lock();
                let cleared = state.consecutive_failures;
                *state = FailureCounter {
                    consecutive_failures: 0,
                    degraded: false,
                    degraded_since: None,
                };
                info!(cleared, probe_sequence = sequence, "left degraded mode");
                self.events.emit("reset_succeeded", json!({ "cleared_failures": cleared }));
                Ok(())
            }
            Err(error) => {
                self.record_failure("degraded_probe", &error);
                let consecutive_failures = self.lock().consecutive_failures;
                self.events.emit(
                    "reset_failed",
                    json!({ "error": error.to_string(), "consecutive_failures": consecutive_failures }),
                );
                Err(EngineError::ProbeFailed(error))
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, FailureCounter> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
