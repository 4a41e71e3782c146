//! Per-document fan-out to every session except the originator.
//!
//! Uses a tokio broadcast channel for O(1) send to all subscribers. Each
//! session gets an independent receiver that buffers up to `capacity` frames;
//! a session that falls further behind sees `Lagged` and is disconnected so
//! it can re-sync from a fresh `init`.
//!
//! Reference: Patterson & Hennessy, Section 6.4, Interconnection Networks

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Server-assigned connection identifier, unique per process.
pub type SessionId = u64;

/// WebSocket message type a frame goes out as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    #[default]
    Text,
    /// Same UTF-8 payload, sent as a binary message.
    Binary,
}

/// One encoded frame on its way to the sessions of a document.
#[derive(Debug)]
pub struct Outbound {
    /// Session that caused the frame; it is skipped on delivery.
    pub origin: Option<SessionId>,
    pub kind: FrameKind,
    pub frame: Arc<str>,
}

impl Outbound {
    /// Whether `session` should receive this frame.
    pub fn is_for(&self, session: SessionId) -> bool {
        self.origin != Some(session)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub sessions_lagged: u64,
    pub active_sessions: usize,
}

/// A broadcast group for a single document.
///
/// Also owns the roster: the user identity of every attached session, in
/// join order. The roster lives here rather than in the coordinator so it
/// survives the coordinator being evicted.
#[derive(Debug)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Outbound>>,
    roster: RwLock<Vec<(SessionId, String)>>,
    capacity: usize,
    frames_sent: AtomicU64,
    sessions_lagged: AtomicU64,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per session before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            roster: RwLock::new(Vec::new()),
            capacity,
            frames_sent: AtomicU64::new(0),
            sessions_lagged: AtomicU64::new(0),
        }
    }

    /// Register a session and subscribe it to subsequent frames.
    pub async fn add_session(
        &self,
        id: SessionId,
        user_id: impl Into<String>,
    ) -> broadcast::Receiver<Arc<Outbound>> {
        let mut roster = self.roster.write().await;
        roster.push((id, user_id.into()));
        self.sender.subscribe()
    }

    /// Deregister a session. Returns its user identity if it was known.
    pub async fn remove_session(&self, id: SessionId) -> Option<String> {
        let mut roster = self.roster.write().await;
        let pos = roster.iter().position(|(sid, _)| *sid == id)?;
        Some(roster.remove(pos).1)
    }

    /// Send `frame` to every session except `origin`.
    ///
    /// Never blocks: slow receivers lag instead of holding up the sender.
    /// Returns the number of subscribed receivers.
    pub fn broadcast(&self, origin: Option<SessionId>, frame: Arc<str>) -> usize {
        self.relay(origin, FrameKind::Text, frame)
    }

    /// Like [`broadcast`](Self::broadcast), keeping the message type the
    /// frame arrived with.
    pub fn relay(&self, origin: Option<SessionId>, kind: FrameKind, frame: Arc<str>) -> usize {
        let count = self
            .sender
            .send(Arc::new(Outbound { origin, kind, frame }))
            .unwrap_or(0);
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record that a session was dropped for lagging.
    pub fn record_lagged(&self) {
        self.sessions_lagged.fetch_add(1, Ordering::Relaxed);
    }

    /// User identities of attached sessions, in join order.
    pub async fn roster(&self) -> Vec<String> {
        self.roster
            .read()
            .await
            .iter()
            .map(|(_, user)| user.clone())
            .collect()
    }

    pub async fn session_count(&self) -> usize {
        self.roster.read().await.len()
    }

    pub async fn has_session(&self, id: SessionId) -> bool {
        self.roster.read().await.iter().any(|(sid, _)| *sid == id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            sessions_lagged: self.sessions_lagged.load(Ordering::Relaxed),
            active_sessions: self.session_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
