//! Replicated text store backed by a Yrs document.
//!
//! One store holds one logical text buffer. Every insertion carries a unique
//! `(client, clock)` identity and deletions leave tombstones, so merging the
//! same set of updates in any order (and any number of times) converges:
//!
//! ```text
//!  replica A              replica B
//!  insert "x" ──┐     ┌── insert "y"
//!               ▼     ▼
//!            update blobs (any order, duplicates ok)
//!               │     │
//!               ▼     ▼
//!  current_text(A) == current_text(B)
//! ```
//!
//! Offsets are UTF-8 byte offsets. Out-of-range and mid-character offsets are
//! rejected, never clamped.
//!
//! Reference: Shapiro et al., "Conflict-free Replicated Data Types" (2011)

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    merge_updates_v1, Doc, GetString, OffsetKind, Options, ReadTxn, StateVector, Text, TextRef,
    Transact, Update,
};

use crate::diff::{self, EditOp};
use crate::error::TextError;
use crate::update_check;

/// Watermark of everything a store has seen, used to encode deltas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateMarker(StateVector);

impl StateMarker {
    /// Marker of an empty store; a delta since it is the full state.
    pub fn empty() -> Self {
        Self(StateVector::default())
    }

    pub fn encode(&self) -> Vec<u8> {
        self.0.encode_v1()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, TextError> {
        StateVector::decode_v1(bytes)
            .map(Self)
            .map_err(|e| TextError::Decode(e.to_string()))
    }
}

/// A single shared text buffer plus its CRDT bookkeeping.
pub struct TextStore {
    doc: Doc,
    text: TextRef,
    name: String,
}

impl TextStore {
    /// Create an empty store whose root text is called `name`.
    ///
    /// Replicas of the same document must use the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut options = Options::default();
        options.offset_kind = OffsetKind::Bytes;
        let doc = Doc::with_options(options);
        let text = doc.get_or_insert_text(name.as_str());
        Self { doc, text, name }
    }

    /// Create a store and merge `blob` (full state or delta) into it.
    pub fn from_update(name: impl Into<String>, blob: &[u8]) -> Result<Self, TextError> {
        let mut store = Self::new(name);
        store.apply_remote(blob)?;
        Ok(store)
    }

    /// Name of the root text.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Present content of the buffer.
    pub fn current_text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    /// Length of the buffer in bytes.
    pub fn len(&self) -> usize {
        self.current_text().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `chunk` before byte `offset`.
    pub fn insert(&mut self, offset: usize, chunk: &str) -> Result<(), TextError> {
        diff::check_range(&self.current_text(), offset, 0)?;
        let mut txn = self.doc.transact_mut();
        self.text.insert(&mut txn, offset as u32, chunk);
        Ok(())
    }

    /// Remove `len` bytes starting at byte `offset`.
    pub fn delete(&mut self, offset: usize, len: usize) -> Result<(), TextError> {
        diff::check_range(&self.current_text(), offset, len)?;
        if len == 0 {
            return Ok(());
        }
        let mut txn = self.doc.transact_mut();
        self.text.remove_range(&mut txn, offset as u32, len as u32);
        Ok(())
    }

    /// Apply `ops` inside one transaction.
    ///
    /// The ops are checked against a scratch copy first, so either all of them
    /// land or none do. Returns the transaction's update blob and the text it
    /// produced, read inside the same transaction.
    pub fn transact_ops(&mut self, ops: &[EditOp]) -> Result<(Vec<u8>, String), TextError> {
        diff::apply_ops(&self.current_text(), ops)?;

        let mut txn = self.doc.transact_mut();
        for op in ops {
            match op {
                EditOp::Insert { offset, text } => {
                    self.text.insert(&mut txn, *offset as u32, text);
                }
                EditOp::Delete { offset, len } => {
                    self.text.remove_range(&mut txn, *offset as u32, *len as u32);
                }
            }
        }
        let text = self.text.get_string(&txn);
        let update = txn.encode_update_v1();
        Ok((update, text))
    }

    /// Marker for everything this store has integrated so far.
    pub fn state_marker(&self) -> StateMarker {
        let txn = self.doc.transact();
        StateMarker(txn.state_vector())
    }

    /// Entire state, enough for an empty replica to rebuild content and
    /// bookkeeping.
    pub fn encode_full_state(&self) -> Vec<u8> {
        self.encode_delta_since(&StateMarker::empty())
    }

    /// Only the changes a replica at `marker` has not seen.
    ///
    /// Parts still waiting on missing dependencies are carried along, so a
    /// store rebuilt from this blob holds them too.
    pub fn encode_delta_since(&self, marker: &StateMarker) -> Vec<u8> {
        let txn = self.doc.transact();
        let integrated = txn.encode_diff_v1(&marker.0);

        let store = txn.store();
        let mut parts = Vec::new();
        if let Some(pending) = store.pending_update() {
            parts.push(pending.update.encode_v1());
        }
        if let Some(ds) = store.pending_ds() {
            // An update with no structs, only the delete set.
            let mut blob = vec![0];
            blob.extend(ds.encode_v1());
            parts.push(blob);
        }
        if parts.is_empty() {
            return integrated;
        }

        parts.insert(0, integrated);
        match merge_updates_v1(&parts) {
            Ok(merged) => merged,
            Err(e) => {
                log::warn!("[TextStore] {}: dropping pending parts from encoding: {}", self.name, e);
                parts.swap_remove(0)
            }
        }
    }

    /// Merge a peer's full-state or delta blob.
    ///
    /// Already-integrated parts of the blob are skipped, so redelivery is
    /// harmless. Parts whose causal dependencies are missing are held back
    /// until those dependencies arrive. Blobs carrying strings that are not
    /// valid UTF-8 are rejected before anything is merged.
    pub fn apply_remote(&mut self, blob: &[u8]) -> Result<(), TextError> {
        update_check::check_update_v1(blob)?;
        let update = Update::decode_v1(blob).map_err(|e| TextError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| TextError::Apply(e.to_string()))?;
        Ok(())
    }
}

impl std::fmt::Debug for TextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextStore")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
