//! Local edit translator: editor snapshots in, one CRDT update out.
//!
//! The editor surface hands over the text before and after a keystroke (or a
//! paste, or an autocorrect). The translator diffs the two, applies the
//! resulting single-character ops to the store inside one transaction and
//! returns the update blob that represents the whole edit as a unit.

use crate::diff::{self, EditOp};
use crate::error::TextError;
use crate::text_store::TextStore;

/// Result of translating one local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEdit {
    /// Update blob for this edit only, ready to send.
    pub update: Vec<u8>,
    /// Store content after the edit, as normalised by the CRDT.
    pub text: String,
    /// The ops that were applied, in order.
    pub ops: Vec<EditOp>,
}

/// Translate `old -> new` into store operations and apply them atomically.
///
/// Returns `Ok(None)` when the texts are equal. On `Err` the store is left
/// untouched.
pub fn translate(store: &mut TextStore, old: &str, new: &str) -> Result<Option<LocalEdit>, TextError> {
    let ops = diff::diff(old, new);
    if ops.is_empty() {
        return Ok(None);
    }

    let (update, text) = store.transact_ops(&ops).inspect_err(|e| {
        log::error!(
            "local edit on '{}' rejected ({} ops): {e}",
            store.name(),
            ops.len()
        );
    })?;

    if text != new {
        log::debug!(
            "store '{}' normalised local edit: {} bytes requested, {} bytes stored",
            store.name(),
            new.len(),
            text.len()
        );
    }

    Ok(Some(LocalEdit { update, text, ops }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_edit_is_skipped() {
        let mut store = TextStore::new("d1");
        store.insert(0, "same").unwrap();
        assert_eq!(translate(&mut store, "same", "same").unwrap(), None);
    }

    #[test]
    fn test_edit_applies_and_encodes() {
        let mut store = TextStore::new("d1");
        let edit = translate(&mut store, "", "hi").unwrap().unwrap();
        assert_eq!(edit.text, "hi");
        assert_eq!(edit.ops.len(), 2);
        assert_eq!(store.current_text(), "hi");

        let mut peer = TextStore::new("d1");
        peer.apply_remote(&edit.update).unwrap();
        assert_eq!(peer.current_text(), "hi");
    }

    #[test]
    fn test_successive_edits_ship_deltas() {
        let mut store = TextStore::new("d1");
        let mut peer = TextStore::new("d1");

        let first = translate(&mut store, "", "hello").unwrap().unwrap();
        let second = translate(&mut store, "hello", "help").unwrap().unwrap();
        peer.apply_remote(&first.update).unwrap();
        peer.apply_remote(&second.update).unwrap();
        assert_eq!(peer.current_text(), "help");
    }

    #[test]
    fn test_stale_old_text_rejected_without_mutation() {
        let mut store = TextStore::new("d1");
        store.insert(0, "ab").unwrap();
        // The editor believes the buffer is longer than it is.
        let err = translate(&mut store, "abcdef", "abcde").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::OutOfRange);
        assert_eq!(store.current_text(), "ab");
    }
}
