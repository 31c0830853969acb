// Replica-side components: CRDT document, update gate, conflict arbitration,
// degraded mode, eviction cache, and the workspace that wires them together.

pub mod cache;
pub mod conflict;
pub mod degraded;
pub mod gate;
pub mod workspace;
pub mod ydoc;
