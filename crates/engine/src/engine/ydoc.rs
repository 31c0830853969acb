// Y.Doc wrapper using yrs (y-crdt Rust bindings).
// Every mutating transaction is tagged with an `UpdateOrigin`.

use anyhow::{anyhow, Context, Result};
use replica_common::UpdateOrigin;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Subscription, Text, Transact, Update};

/// Wrapper around a Yjs document held by one replica.
pub struct YDoc {
    doc: Doc,
}

impl YDoc {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self { doc: Doc::new() }
    }

    /// Create a document with a specific client ID (for deterministic testing).
    pub fn with_client_id(client_id: u64) -> Self {
        let options = yrs::Options { client_id, ..Default::default() };
        Self { doc: Doc::with_options(options) }
    }

    /// Load a document from a binary state (full snapshot).
    pub fn from_state(data: &[u8]) -> Result<Self> {
        let doc = Self::new();
        doc.apply_update_with_origin(data, UpdateOrigin::PersistenceReplay)
            .context("failed to load Yjs state")?;
        Ok(doc)
    }

    /// Apply an incremental binary update inside a transaction tagged with `origin`.
    pub fn apply_update_with_origin(&self, data: &[u8], origin: UpdateOrigin) -> Result<()> {
        let update = Update::decode_v1(data).context("failed to decode Yjs update")?;
        self.doc
            .transact_mut_with(origin.as_str())
            .apply_update(update)
            .context("failed to apply Yjs update")?;
        Ok(())
    }

    /// Encode the full document state as a binary blob.
    pub fn encode_state(&self) -> Vec<u8> {
        self.doc.transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the state vector (logical timestamp) for sync protocol.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Compute a diff (update) containing all changes since the given state vector.
    pub fn encode_diff(&self, remote_sv: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_sv).context("failed to decode state vector")?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    /// Read the string content of a named text type.
    pub fn get_text_string(&self, name: &str) -> String {
        let text = self.doc.get_or_insert_text(name);
        text.get_string(&self.doc.transact())
    }

    /// Insert text at position in a named text type.
    pub fn insert_text_with_origin(
        &self,
        name: &str,
        index: u32,
        content: &str,
        origin: UpdateOrigin,
    ) {
        let text = self.doc.get_or_insert_text(name);
        let mut txn = self.doc.transact_mut_with(origin.as_str());
        text.insert(&mut txn, index, content);
    }

    /// Register `on_update` for every committed transaction that changed the document.
    ///
    /// The callback receives the resolved origin and the v1-encoded update. The
    /// observer stays attached until the returned subscription is dropped.
    pub fn observe_updates<F>(&self, on_update: F) -> Result<Subscription>
    where
        F: Fn(Result<UpdateOrigin, replica_common::OriginCodecError>, &[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                let origin = txn.origin().map(|value| value.as_ref());
                on_update(UpdateOrigin::from_transaction_origin(origin), &event.update);
            })
            .map_err(|error| anyhow!("failed to observe document updates: {error:?}"))
    }
}

impl Default for YDoc {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold a base state and a run of updates into one full-state update.
pub fn merge_into_state<'a>(
    base: Option<&[u8]>,
    updates: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Vec<u8>> {
    let doc = YDoc::new();
    if let Some(base) = base {
        doc.apply_update_with_origin(base, UpdateOrigin::PersistenceReplay)
            .context("failed to apply base state")?;
    }
    for update in updates {
        doc.apply_update_with_origin(update, UpdateOrigin::PersistenceReplay)?;
    }
    Ok(doc.encode_state())
}
