// replica-engine library entry point.

pub mod config;
pub mod engine;
pub mod error;
pub mod persistence;
pub mod store;
pub mod telemetry;

pub use config::EngineConfig;
pub use engine::conflict::{ConflictEvidence, EditGuardState, RemoteOutcome};
pub use engine::workspace::{OpenOutcome, Workspace};
pub use engine::ydoc::YDoc;
pub use error::{EngineError, Result};
pub use store::{FileStorage, MemoryStorage, Storage, StorageError};
pub use telemetry::{EventSink, MemoryEventSink, TracingEventSink};
