//! Per-document coordinators and the registry that routes to them.
//!
//! Architecture:
//! ```text
//!  connection tasks                 DocumentRegistry
//!  ┌──────────┐  Command   ┌──────────────────────────────────┐
//!  │ session 1│ ─────────► │ doc_id ─► Slot { room, inbox }   │
//!  │ session 2│ ─────────► │              │           │       │
//!  └────▲─────┘            └──────────────┼───────────┼───────┘
//!       │                                 │           ▼
//!       │ frames             BroadcastGroup   Coordinator task
//!       └──────────────────── (roster +   ◄── (TextStore, one
//!                              fan-out)       command at a time)
//!                                                  │
//!                                                  ▼
//!                                            SnapshotStore
//! ```
//!
//! Each coordinator is a task that owns the document's authoritative
//! [`TextStore`] and drains its inbox one command at a time, so a single
//! session's updates are applied and rebroadcast in the order it sent them.
//!
//! Snapshot reads and writes run on the blocking pool. Until the last
//! snapshot has been read successfully the coordinator does not save, and it
//! retries the read before each command.
//!
//! After `idle_eviction` without commands the task exits and drops its
//! store. The slot (and with it the roster and every open connection's
//! receiver) stays in the registry; the next command spawns a fresh
//! coordinator that hydrates from the snapshot store before handling it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tandem_core::TextStore;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use crate::broadcast::{BroadcastGroup, FrameKind, Outbound, SessionId};
use crate::protocol::{self, WireMessage};
use crate::storage::SnapshotStore;

/// Coordinator tuning shared by every document.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Frames buffered per session before it is considered lagging
    pub broadcast_capacity: usize,
    /// Idle time after which a coordinator's in-memory state is dropped
    pub idle_eviction: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            idle_eviction: Duration::from_secs(10 * 60),
        }
    }
}

/// Handed back to a connection once the coordinator has registered it.
#[derive(Debug)]
pub struct Joined {
    /// Encoded `init` frame for this session only.
    pub init: Arc<str>,
    /// Frames for the document, subscribed before `init` was built.
    pub frames: broadcast::Receiver<Arc<Outbound>>,
    /// The document's fan-out group, for reporting lag.
    pub room: Arc<BroadcastGroup>,
}

/// Work item for a coordinator.
#[derive(Debug)]
pub enum Command {
    Connect {
        session: SessionId,
        user_id: String,
        reply: oneshot::Sender<Joined>,
    },
    Inbound {
        session: SessionId,
        kind: FrameKind,
        frame: Arc<str>,
    },
    Disconnect {
        session: SessionId,
    },
}

struct Slot {
    room: Arc<BroadcastGroup>,
    inbox: Option<mpsc::UnboundedSender<Command>>,
}

/// Routes commands to per-document coordinators, spawning them on demand.
pub struct DocumentRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    store: Arc<dyn SnapshotStore>,
    config: CoordinatorConfig,
    next_session: AtomicU64,
    hydrations: AtomicU64,
}

impl DocumentRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(HashMap::new()),
            store,
            config,
            next_session: AtomicU64::new(1),
            hydrations: AtomicU64::new(0),
        })
    }

    /// Allocate a process-unique session id.
    pub fn next_session_id(&self) -> SessionId {
        self.next_session.fetch_add(1, Ordering::Relaxed)
    }

    /// Attach a session to `doc_id` and wait for its `init` frame.
    ///
    /// Returns `None` if the coordinator went away before answering.
    pub async fn connect(
        self: &Arc<Self>,
        doc_id: &str,
        session: SessionId,
        user_id: &str,
    ) -> Option<Joined> {
        let (reply, joined) = oneshot::channel();
        self.dispatch(
            doc_id,
            Command::Connect {
                session,
                user_id: user_id.to_string(),
                reply,
            },
        )
        .await;
        joined.await.ok()
    }

    /// Queue an inbound text frame from `session`.
    pub async fn inbound(self: &Arc<Self>, doc_id: &str, session: SessionId, frame: Arc<str>) {
        self.inbound_as(doc_id, session, FrameKind::Text, frame).await;
    }

    /// Queue an inbound frame that is relayed with the same message type.
    pub async fn inbound_as(
        self: &Arc<Self>,
        doc_id: &str,
        session: SessionId,
        kind: FrameKind,
        frame: Arc<str>,
    ) {
        self.dispatch(doc_id, Command::Inbound { session, kind, frame }).await;
    }

    /// Detach `session` from `doc_id`.
    pub async fn disconnect(self: &Arc<Self>, doc_id: &str, session: SessionId) {
        self.dispatch(doc_id, Command::Disconnect { session }).await;
    }

    /// Deliver `cmd` to the document's coordinator, starting one if needed.
    ///
    /// The send happens under the registry lock, which is what lets an idle
    /// coordinator prove its inbox is empty before it exits.
    pub async fn dispatch(self: &Arc<Self>, doc_id: &str, cmd: Command) {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(doc_id.to_string()).or_insert_with(|| Slot {
            room: Arc::new(BroadcastGroup::new(self.config.broadcast_capacity)),
            inbox: None,
        });

        let cmd = match &slot.inbox {
            Some(inbox) => match inbox.send(cmd) {
                Ok(()) => return,
                Err(mpsc::error::SendError(cmd)) => cmd,
            },
            None => cmd,
        };

        let (inbox, rx) = mpsc::unbounded_channel();
        // The receiver is alive in this scope, so this cannot fail.
        let _ = inbox.send(cmd);
        slot.inbox = Some(inbox);

        tokio::spawn(Coordinator::run(
            doc_id.to_string(),
            slot.room.clone(),
            self.store.clone(),
            rx,
            self.clone(),
        ));
    }

    /// Called by an idle coordinator. Detaches it if nothing is queued.
    async fn try_evict(&self, doc_id: &str, rx: &mpsc::UnboundedReceiver<Command>) -> bool {
        let mut slots = self.slots.lock().await;
        if !rx.is_empty() {
            return false;
        }
        if let Some(slot) = slots.get_mut(doc_id) {
            slot.inbox = None;
            if slot.room.session_count().await == 0 {
                slots.remove(doc_id);
            }
        }
        true
    }

    /// Documents that currently have a live coordinator.
    pub async fn resident_documents(&self) -> Vec<String> {
        let slots = self.slots.lock().await;
        let mut docs: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| slot.inbox.as_ref().is_some_and(|tx| !tx.is_closed()))
            .map(|(id, _)| id.clone())
            .collect();
        docs.sort();
        docs
    }

    /// Roster of `doc_id`, empty if the document is unknown.
    pub async fn roster(&self, doc_id: &str) -> Vec<String> {
        let room = {
            let slots = self.slots.lock().await;
            slots.get(doc_id).map(|slot| slot.room.clone())
        };
        match room {
            Some(room) => room.roster().await,
            None => Vec::new(),
        }
    }

    /// Number of times a coordinator has loaded its state from storage.
    pub fn hydration_count(&self) -> u64 {
        self.hydrations.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }
}

/// Authority for one document while resident in memory.
struct Coordinator {
    doc_id: String,
    room: Arc<BroadcastGroup>,
    store: Arc<dyn SnapshotStore>,
    text: TextStore,
    /// Set once the snapshot has been read (or found missing).
    hydrated: bool,
}

impl Coordinator {
    async fn run(
        doc_id: String,
        room: Arc<BroadcastGroup>,
        store: Arc<dyn SnapshotStore>,
        mut rx: mpsc::UnboundedReceiver<Command>,
        registry: Arc<DocumentRegistry>,
    ) {
        let text = TextStore::new(doc_id.as_str());
        let mut this = Self {
            doc_id,
            room,
            store,
            text,
            hydrated: false,
        };
        // Hydration completes before the first command leaves the inbox.
        this.hydrate().await;
        registry.hydrations.fetch_add(1, Ordering::Relaxed);

        let idle = registry.config.idle_eviction;
        loop {
            match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Some(cmd)) => {
                    if !this.hydrated {
                        this.hydrate().await;
                    }
                    this.handle(cmd).await
                }
                Ok(None) => break,
                Err(_) => {
                    if registry.try_evict(&this.doc_id, &rx).await {
                        log::info!(
                            "Evicted idle coordinator for '{}' ({} sessions still open)",
                            this.doc_id,
                            this.room.session_count().await
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Merge the last snapshot into the authoritative store.
    ///
    /// A failed read leaves `hydrated` unset; edits keep being merged and
    /// broadcast from memory, and the snapshot they are merged into is read
    /// again before the next command.
    async fn hydrate(&mut self) {
        let store = self.store.clone();
        let doc_id = self.doc_id.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load_snapshot(&doc_id)).await;

        let doc_id = &self.doc_id;
        match loaded {
            Ok(Ok(Some(blob))) => {
                match self.text.apply_remote(&blob) {
                    Ok(()) => log::info!(
                        "Hydrated '{doc_id}' from snapshot ({} bytes, text length {})",
                        blob.len(),
                        self.text.len()
                    ),
                    Err(e) => log::error!("Snapshot for '{doc_id}' is unreadable, ignoring it: {e}"),
                }
                self.hydrated = true;
            }
            Ok(Ok(None)) => {
                log::debug!("No snapshot for '{doc_id}', starting empty");
                self.hydrated = true;
            }
            Ok(Err(e)) => log::error!("Failed to load snapshot for '{doc_id}', saves held back: {e}"),
            Err(e) => log::error!("Snapshot load for '{doc_id}' did not complete: {e}"),
        }
    }

    /// Write the full state, unless the stored snapshot was never read.
    async fn persist(&self) {
        if !self.hydrated {
            log::warn!("Not saving '{}' before its snapshot has been loaded", self.doc_id);
            return;
        }
        let store = self.store.clone();
        let doc_id = self.doc_id.clone();
        let snapshot = self.text.encode_full_state();
        match tokio::task::spawn_blocking(move || store.save_snapshot(&doc_id, &snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::error!("Failed to persist snapshot for '{}': {e}", self.doc_id),
            Err(e) => log::error!("Snapshot save for '{}' did not complete: {e}", self.doc_id),
        }
    }

    async fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Connect {
                session,
                user_id,
                reply,
            } => self.on_connect(session, user_id, reply).await,
            Command::Inbound { session, kind, frame } => self.on_inbound(session, kind, frame).await,
            Command::Disconnect { session } => self.on_disconnect(session).await,
        }
    }

    async fn on_connect(&mut self, session: SessionId, user_id: String, reply: oneshot::Sender<Joined>) {
        let frames = self.room.add_session(session, user_id.as_str()).await;
        let init = WireMessage::init(self.text.encode_full_state(), self.room.roster().await);

        let init = match init.encode() {
            Ok(frame) => Arc::<str>::from(frame),
            Err(e) => {
                log::error!("Failed to encode init for '{}': {e}", self.doc_id);
                self.room.remove_session(session).await;
                return;
            }
        };

        let joined = Joined {
            init,
            frames,
            room: self.room.clone(),
        };
        if reply.send(joined).is_err() {
            // The connection closed while waiting for us.
            self.room.remove_session(session).await;
            return;
        }

        log::info!("Session {session} ({user_id}) joined '{}'", self.doc_id);
        self.broadcast(Some(session), &WireMessage::join(user_id));
    }

    async fn on_inbound(&mut self, session: SessionId, kind: FrameKind, frame: Arc<str>) {
        let update = match protocol::decode_inbound(&frame) {
            Ok(update) => update,
            Err(e) => {
                log::warn!("Dropped frame from session {session} on '{}': {e}", self.doc_id);
                return;
            }
        };

        if let Err(e) = self.text.apply_remote(&update.data) {
            log::warn!(
                "Dropped update from {} (session {session}) on '{}': {e}",
                update.user_id,
                self.doc_id
            );
            return;
        }

        self.persist().await;

        log::trace!(
            "Applied {} byte update from {} on '{}'",
            update.data.len(),
            update.user_id,
            self.doc_id
        );
        self.room.relay(Some(session), kind, frame);
    }

    async fn on_disconnect(&mut self, session: SessionId) {
        if let Some(user_id) = self.room.remove_session(session).await {
            log::info!("Session {session} ({user_id}) left '{}'", self.doc_id);
            self.broadcast(None, &WireMessage::leave(user_id));
        }
    }

    fn broadcast(&self, origin: Option<SessionId>, msg: &WireMessage) {
        match msg.encode() {
            Ok(frame) => {
                self.room.broadcast(origin, Arc::from(frame));
            }
            Err(e) => log::error!("Failed to encode {} for '{}': {e}", msg.type_name(), self.doc_id),
        }
    }
}
