//! # tandem-collab: Real-time collaboration layer for Tandem
//!
//! Keeps many editors of the same document converged over WebSockets, with
//! the server holding the authoritative replica and checkpointing it.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐     WebSocket      ┌─────────────────┐
//! │ DocumentClient │ ◄─────────────────► │   SyncServer    │
//! │  + Session     │     JSON frames     │   (handshake)   │
//! └───────┬────────┘                     └────────┬────────┘
//!         │                                       │
//!         ▼                                       ▼
//! ┌────────────────┐                     ┌─────────────────┐
//! │   TextStore    │                     │ DocumentRegistry│
//! │   (replica)    │                     │ one Coordinator │
//! └────────────────┘                     │ per document    │
//!                                        └───┬─────────┬───┘
//!                                            │         │
//!                                   ┌────────┴───┐ ┌───┴───────────┐
//!                                   │ Broadcast  │ │ SnapshotStore │
//!                                   │ Group      │ │ (RocksDB/mem) │
//!                                   └────────────┘ └───────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON wire messages (`init`, `join`, `leave`, `update`)
//! - [`handshake`]: Upgrade-request validation
//! - [`broadcast`]: Per-document fan-out and roster
//! - [`coordinator`]: Per-document authority with idle eviction
//! - [`server`]: WebSocket sync server
//! - [`session`]: Client connection state machine
//! - [`client`]: Client document orchestrator with offline catch-up
//! - [`identity`]: Stable per-install user id
//! - [`storage`]: Snapshot persistence

pub mod broadcast;
pub mod client;
pub mod coordinator;
pub mod handshake;
pub mod identity;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, FrameKind, SessionId};
pub use client::{ClientError, ClientEvent, ContentUpdate, DocumentClient, EditOrigin};
pub use coordinator::{CoordinatorConfig, DocumentRegistry};
pub use handshake::{JoinRequest, Rejection};
pub use identity::UserIdentity;
pub use protocol::{ProtocolError, WireMessage};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{ConnectionState, Session, SessionConfig, SessionError, SessionEvent};
pub use storage::{
    DocumentMetadata, MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError,
};
