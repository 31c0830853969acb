// Core domain types shared across all replica crates.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crdt::origin::UpdateOrigin;

/// Storage-assigned, per-document monotonic sequence. `0` means nothing stored.
pub type Sequence = u64;

pub const MAX_DOC_KEY_LEN: usize = 128;
/// Reserved key written by degraded-mode recovery probes.
pub const PROBE_DOC_KEY: &str = "__degraded_probe__";

/// Stable identifier of a document, safe to use as a file name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(try_from = "String", into = "String")]
pub struct DocKey(String);

impl DocKey {
    pub fn new(key: impl Into<String>) -> Result<Self, DocKeyError> {
        let key = key.into();
        if key.is_empty() {
            return Err(DocKeyError::Empty);
        }
        if key.len() > MAX_DOC_KEY_LEN {
            return Err(DocKeyError::TooLong { len: key.len(), max: MAX_DOC_KEY_LEN });
        }
        if key.starts_with('.') {
            return Err(DocKeyError::LeadingDot);
        }
        if key == PROBE_DOC_KEY {
            return Err(DocKeyError::Reserved(key));
        }
        if let Some(invalid) =
            key.chars().find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(DocKeyError::InvalidChar(invalid));
        }
        Ok(Self(key))
    }

    /// Key used for connectivity probe writes. `new` refuses it, so it can
    /// never be opened as a document.
    pub fn degraded_probe() -> Self {
        Self(PROBE_DOC_KEY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocKey {
    type Error = DocKeyError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl std::str::FromStr for DocKey {
    type Err = DocKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<DocKey> for String {
    fn from(key: DocKey) -> Self {
        key.0
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DocKeyError {
    #[error("document key must not be empty")]
    Empty,
    #[error("document key exceeds maximum length ({max} bytes), got {len}")]
    TooLong { len: usize, max: usize },
    #[error("document key must not start with `.`")]
    LeadingDot,
    #[error("document key contains invalid character `{0}`")]
    InvalidChar(char),
    #[error("document key `{0}` is reserved")]
    Reserved(String),
}

/// One CRDT update travelling between a document and the durable log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateRecord {
    pub doc_key: DocKey,
    /// Assigned by storage once persisted; never chosen by the client.
    pub sequence: Option<Sequence>,
    pub payload: Vec<u8>,
    pub origin: UpdateOrigin,
}

impl UpdateRecord {
    pub fn new(doc_key: DocKey, payload: Vec<u8>, origin: UpdateOrigin) -> Self {
        Self { doc_key, sequence: None, payload, origin }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictReason {
    LocalEditsPending,
}

impl fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalEditsPending => f.write_str("local edits pending"),
        }
    }
}

/// A remote version that was not applied because it would clobber unsaved local edits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConflictEvent {
    pub doc_key: DocKey,
    pub reason: ConflictReason,
    /// The remote version that was blocked.
    pub version: Sequence,
    pub cached_version: Sequence,
    pub detected_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_file_safe_keys() {
        for key in ["note-1", "a", "Doc_2.v3", "__degraded_probe"] {
            assert!(DocKey::new(key).is_ok(), "{key} should be valid");
        }
    }

    #[test]
    fn reserved_key_is_refused() {
        assert_eq!(DocKey::new(PROBE_DOC_KEY), Err(DocKeyError::Reserved(PROBE_DOC_KEY.to_string())));
        assert!(serde_json::from_str::<DocKey>("\"__degraded_probe__\"").is_err());
        assert_eq!(DocKey::degraded_probe().as_str(), PROBE_DOC_KEY);
    }

    #[test]
    fn rejects_unsafe_keys() {
        assert_eq!(DocKey::new(""), Err(DocKeyError::Empty));
        assert_eq!(DocKey::new(".hidden"), Err(DocKeyError::LeadingDot));
        assert_eq!(DocKey::new("a/b"), Err(DocKeyError::InvalidChar('/')));
        assert_eq!(
            DocKey::new("x".repeat(MAX_DOC_KEY_LEN + 1)),
            Err(DocKeyError::TooLong { len: MAX_DOC_KEY_LEN + 1, max: MAX_DOC_KEY_LEN })
        );
    }

    #[test]
    fn doc_key_serde_validates() {
        let key: DocKey = serde_json::from_str("\"note-1\"").expect("valid key");
        assert_eq!(key.as_str(), "note-1");
        assert!(serde_json::from_str::<DocKey>("\"../etc\"").is_err());
    }

    #[test]
    fn conflict_reason_reads_naturally() {
        assert_eq!(ConflictReason::LocalEditsPending.to_string(), "local edits pending");
    }
}
