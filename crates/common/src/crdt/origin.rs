use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const LOCAL_TAG: &str = "replica:local";
const REMOTE_TAG: &str = "replica:remote";
const REPLAY_TAG: &str = "replica:persistence-replay";

/// Where an update entered this replica.
///
/// Carried on every [`crate::types::UpdateRecord`] and embedded in CRDT
/// transaction origins so the persistence path can recognise its own replays.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOrigin {
    /// Produced by an editor in this replica.
    Local,
    /// Received from another replica over the sync channel.
    Remote,
    /// Re-applied from durable storage (load, catch-up).
    PersistenceReplay,
}

impl UpdateOrigin {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => LOCAL_TAG,
            Self::Remote => REMOTE_TAG,
            Self::PersistenceReplay => REPLAY_TAG,
        }
    }

    pub fn to_bytes(self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OriginCodecError> {
        match bytes {
            b if b == LOCAL_TAG.as_bytes() => Ok(Self::Local),
            b if b == REMOTE_TAG.as_bytes() => Ok(Self::Remote),
            b if b == REPLAY_TAG.as_bytes() => Ok(Self::PersistenceReplay),
            other => Err(OriginCodecError::UnknownTag(String::from_utf8_lossy(other).into_owned())),
        }
    }

    /// Resolve the origin of an observed transaction. Untagged transactions
    /// come from editors driving the document directly and count as local.
    pub fn from_transaction_origin(origin: Option<&[u8]>) -> Result<Self, OriginCodecError> {
        match origin {
            None => Ok(Self::Local),
            Some(bytes) => Self::from_bytes(bytes),
        }
    }

    /// `false` only for updates that already came out of storage.
    pub fn should_persist(self) -> bool {
        match self {
            Self::Local | Self::Remote => true,
            Self::PersistenceReplay => false,
        }
    }
}

impl fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
            Self::PersistenceReplay => f.write_str("persistence_replay"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OriginCodecError {
    #[error("unknown transaction origin tag `{0}`")]
    UnknownTag(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_round_trips_through_transaction_bytes() {
        for origin in [UpdateOrigin::Local, UpdateOrigin::Remote, UpdateOrigin::PersistenceReplay] {
            let decoded = UpdateOrigin::from_bytes(origin.to_bytes()).expect("tag should decode");
            assert_eq!(decoded, origin);
        }
    }

    #[test]
    fn untagged_transaction_is_local() {
        assert_eq!(UpdateOrigin::from_transaction_origin(None), Ok(UpdateOrigin::Local));
    }

    #[test]
    fn foreign_tag_is_rejected() {
        let error = UpdateOrigin::from_bytes(b"file-watcher").expect_err("foreign tag");
        assert_eq!(error, OriginCodecError::UnknownTag("file-watcher".to_string()));
    }

    #[test]
    fn only_replays_skip_persistence() {
        assert!(UpdateOrigin::Local.should_persist());
        assert!(UpdateOrigin::Remote.should_persist());
        assert!(!UpdateOrigin::PersistenceReplay.should_persist());
    }

    #[test]
    fn serializes_as_snake_case() {
        let json = serde_json::to_string(&UpdateOrigin::PersistenceReplay).expect("serialize");
        assert_eq!(json, "\"persistence_replay\"");
    }
}
