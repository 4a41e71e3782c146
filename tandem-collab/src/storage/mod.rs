//! Persistent snapshot storage for collaborative documents.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  full state   ┌──────────────────┐
//! │ Coordinator │ ────────────► │  SnapshotStore   │
//! │ (per doc)   │  every update │  (upsert by id)  │
//! └──────┬──────┘               └────────┬─────────┘
//!        │                               │
//!        │ on hydration                  ├── MemorySnapshotStore
//!        ▼                               └── RocksSnapshotStore
//! ┌─────────────┐                             │
//! │  TextStore  │                  CF "documents" : LZ4 snapshots
//! │ (restored)  │                  CF "metadata"  : version, sizes
//! └─────────────┘
//! ```
//!
//! Each save overwrites the previous snapshot. The stored blob is always the
//! post-merge full state, so a single read is enough for cold recovery.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

use std::collections::HashMap;
use std::sync::Mutex;

use tandem_core::ErrorKind;
use thiserror::Error;

pub use rocks::{DocumentMetadata, RocksSnapshotStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// RocksDB internal error
    #[error("database error: {0}")]
    Database(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Persistence
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable home for one full-state blob per document.
pub trait SnapshotStore: Send + Sync {
    /// Upsert the snapshot for `doc_id`, replacing any previous one.
    fn save_snapshot(&self, doc_id: &str, blob: &[u8]) -> Result<(), StoreError>;

    /// Most recent snapshot, or `None` if the document was never saved.
    fn load_snapshot(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Process-local store used when no storage path is configured.
///
/// Snapshots survive coordinator eviction but not a restart.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn save_snapshot(&self, doc_id: &str, blob: &[u8]) -> Result<(), StoreError> {
        let mut snapshots = self
            .snapshots
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        snapshots.insert(doc_id.to_string(), blob.to_vec());
        Ok(())
    }

    fn load_snapshot(&self, doc_id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let snapshots = self
            .snapshots
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(snapshots.get(doc_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_upsert() {
        let store = MemorySnapshotStore::new();
        assert!(store.is_empty());
        assert_eq!(store.load_snapshot("d1").unwrap(), None);

        store.save_snapshot("d1", b"first").unwrap();
        store.save_snapshot("d1", b"second").unwrap();
        assert_eq!(store.load_snapshot("d1").unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_memory_store_isolates_documents() {
        let store = MemorySnapshotStore::new();
        store.save_snapshot("a", b"1").unwrap();
        store.save_snapshot("b", b"2").unwrap();
        assert_eq!(store.load_snapshot("a").unwrap().unwrap(), b"1");
        assert_eq!(store.load_snapshot("b").unwrap().unwrap(), b"2");
    }

    #[test]
    fn test_store_error_kind() {
        let err = StoreError::Database("disk full".into());
        assert_eq!(err.kind(), ErrorKind::Persistence);
        assert_eq!(err.to_string(), "database error: disk full");
    }
}
