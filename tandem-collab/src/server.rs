//! WebSocket sync server with per-document coordinators.
//!
//! Architecture:
//! ```text
//! Client A ──┐                                   ┌── MemorySnapshotStore
//!            ├── handshake ── DocumentRegistry ──┤
//! Client B ──┘   (400/426)        │              └── RocksSnapshotStore
//!                                 │
//!                  ┌──────────────┼──────────────┐
//!                  ▼              ▼              ▼
//!            Coordinator d1  Coordinator d2   ...   (one task per doc,
//!                  │                                 evicted when idle)
//!                  ▼
//!            BroadcastGroup ──► Client A, Client B
//! ```
//!
//! Each accepted connection runs one task that forwards inbound frames to
//! the document's coordinator and writes out whatever the document's
//! broadcast group delivers, except its own frames.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapters 5 & 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio_tungstenite::tungstenite::Message;

use crate::broadcast::FrameKind;
use crate::coordinator::{CoordinatorConfig, DocumentRegistry, Joined};
use crate::handshake::{self, JoinRequest};
use crate::protocol::{PING, PONG};
use crate::storage::{MemorySnapshotStore, RocksSnapshotStore, SnapshotStore, StoreConfig, StoreError};

/// Largest request head accepted before the upgrade.
const MAX_REQUEST_HEAD: usize = 8 * 1024;
/// Time a client gets to send its full request head.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// WebSocket endpoint path
    pub path: String,
    /// Broadcast channel capacity per document
    pub broadcast_capacity: usize,
    /// Idle time before a document's coordinator is evicted from memory
    pub idle_eviction: Duration,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            path: "/websocket".to_string(),
            broadcast_capacity: 256,
            idle_eviction: Duration::from_secs(10 * 60),
            storage_path: None,
        }
    }
}

impl ServerConfig {
    fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            broadcast_capacity: self.broadcast_capacity,
            idle_eviction: self.idle_eviction,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub frames_received: u64,
    pub lagged_sessions: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    frames_received: AtomicU64,
    lagged_sessions: AtomicU64,
}

struct Shared {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    stats: AtomicServerStats,
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a server, opening RocksDB at `storage_path` if one is set.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(RocksSnapshotStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemorySnapshotStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing snapshot store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let registry = DocumentRegistry::new(store, config.coordinator_config());
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                stats: AtomicServerStats::default(),
            }),
        }
    }

    /// Default configuration, in-memory snapshots.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemorySnapshotStore::new()))
    }

    /// Bind `bind_addr` and serve until the listener fails.
    pub async fn run(&self) -> std::io::Result<()> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        log::info!(
            "Sync server listening on {} (endpoint {})",
            listener.local_addr()?,
            self.shared.config.path
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, &shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub fn stats(&self) -> ServerStats {
        let s = &self.shared.stats;
        ServerStats {
            total_connections: s.total_connections.load(Ordering::Relaxed),
            active_connections: s.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: s.rejected_handshakes.load(Ordering::Relaxed),
            frames_received: s.frames_received.load(Ordering::Relaxed),
            lagged_sessions: s.lagged_sessions.load(Ordering::Relaxed),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.shared.registry
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Validate, upgrade and serve one connection.
async fn handle_connection(mut stream: TcpStream, addr: SocketAddr, shared: &Shared) -> Result<(), BoxError> {
    let head = match tokio::time::timeout(HANDSHAKE_TIMEOUT, peek_request_head(&stream)).await {
        Ok(Ok(Some(head))) => head,
        Ok(Ok(None)) => return Ok(()),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            log::warn!("Handshake from {addr} timed out");
            return Ok(());
        }
    };

    let request = match handshake::validate_request_head(&head.text, &shared.config.path) {
        Ok(request) => request,
        Err(rejection) => {
            shared.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            log::warn!("Rejected handshake from {addr}: {rejection}");
            // Consume the head so closing does not reset the connection
            // before the client reads the response.
            let mut discard = vec![0u8; head.len];
            stream.read_exact(&mut discard).await?;
            stream.write_all(rejection.to_http_response().as_bytes()).await?;
            stream.shutdown().await?;
            return Ok(());
        }
    };

    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    log::info!(
        "Accepted {} for '{}' from {addr}",
        request.user_id,
        request.doc_id
    );

    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let registry = &shared.registry;
    let session = registry.next_session_id();
    let result = match registry.connect(&request.doc_id, session, &request.user_id).await {
        Some(joined) => run_session(ws_stream, session, &request, joined, shared).await,
        None => Ok(()),
    };
    registry.disconnect(&request.doc_id, session).await;

    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
    log::debug!("Connection closed from {addr} (session {session})");
    result
}

/// Pump frames between one socket and its document until either side ends.
async fn run_session(
    ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
    session: u64,
    request: &JoinRequest,
    joined: Joined,
    shared: &Shared,
) -> Result<(), BoxError> {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let Joined {
        init,
        mut frames,
        room,
    } = joined;
    ws_sender.send(Message::text(init.to_string())).await?;

    let registry = &shared.registry;
    let doc_id = request.doc_id.as_str();

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        // Keep-alive is answered here so it never wakes a coordinator.
                        if text.as_str() == PING {
                            ws_sender.send(Message::text(PONG.to_string())).await?;
                            continue;
                        }
                        shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                        registry.inbound(doc_id, session, Arc::from(text.as_str())).await;
                    }

                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => {
                            shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                            registry
                                .inbound_as(doc_id, session, FrameKind::Binary, Arc::from(text))
                                .await;
                        }
                        Err(e) => {
                            log::warn!("Dropped non-UTF-8 binary frame from session {session}: {e}");
                        }
                    },

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Ok(Message::Close(_))) | None => break,

                    Some(Err(e)) => {
                        log::warn!("WebSocket error on session {session}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            out = frames.recv() => {
                match out {
                    Ok(out) => {
                        if out.is_for(session) {
                            let message = match out.kind {
                                FrameKind::Text => Message::text(out.frame.to_string()),
                                FrameKind::Binary => Message::binary(out.frame.as_bytes().to_vec()),
                            };
                            ws_sender.send(message).await?;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        shared.stats.lagged_sessions.fetch_add(1, Ordering::Relaxed);
                        room.record_lagged();
                        log::warn!(
                            "Session {session} ({}) lagged by {n} frames on '{doc_id}', disconnecting",
                            request.user_id
                        );
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

struct RequestHead {
    text: String,
    len: usize,
}

/// Wait until the full request head is buffered, without consuming it.
async fn peek_request_head(stream: &TcpStream) -> std::io::Result<Option<RequestHead>> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        let len = match handshake::head_length(&buf[..n]) {
            Some(len) => len,
            None if n == buf.len() => n,
            None => {
                if n == seen {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                seen = n;
                continue;
            }
        };
        return Ok(Some(RequestHead {
            text: String::from_utf8_lossy(&buf[..len]).into_owned(),
            len,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:8787");
        assert_eq!(config.path, "/websocket");
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.idle_eviction, Duration::from_secs(600));
        assert!(config.storage_path.is_none());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:8787");
        assert_eq!(server.stats(), ServerStats::default());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert!(server.registry().resident_documents().await.is_empty());
        assert!(dir.path().join("db").exists());
    }

    #[test]
    fn test_coordinator_config_follows_server_config() {
        let config = ServerConfig {
            broadcast_capacity: 8,
            idle_eviction: Duration::from_millis(5),
            ..ServerConfig::default()
        };
        let server = SyncServer::with_store(config, Arc::new(MemorySnapshotStore::new()));
        assert_eq!(server.registry().config().broadcast_capacity, 8);
        assert_eq!(server.registry().config().idle_eviction, Duration::from_millis(5));
    }
}
