// replica-common: shared types for the replica workspace

pub mod crdt;
pub mod event;
pub mod types;

pub use crdt::origin::{OriginCodecError, UpdateOrigin};
pub use event::{Component, EngineEvent};
pub use types::{ConflictEvent, ConflictReason, DocKey, DocKeyError, Sequence, UpdateRecord};
