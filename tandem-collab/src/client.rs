//! Client-side document orchestrator.
//!
//! Owns the local replica of one open document and keeps it in step with the
//! server through a [`Session`]:
//!
//! ```text
//!  editor ── apply_local_edit(old, new) ──┐
//!                                         ▼
//!                          ┌──────── Mutex<OpenDocument> ────────┐
//!                          │  TextStore · collaborators · doc_id │
//!                          └─────────────────────────────────────┘
//!                                ▲                   │ update
//!        init / join / leave /   │                   ▼
//!        update (pump task)  ────┘              Session ──► server
//!                                │
//!                                ▼
//!                   ClientEvent stream ──► editor (text, roster, state)
//! ```
//!
//! Every mutation of the replica, local or remote, goes through the one
//! mutex, so the text is never observed mid-transaction. Edits made while
//! disconnected stay in the replica; after the next `init` the client sends
//! whatever the server's state is missing.
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 5

use std::collections::BTreeSet;
use std::sync::Arc;

use tandem_core::{translate, ErrorKind, StateMarker, TextError, TextStore};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use crate::identity::UserIdentity;
use crate::protocol::WireMessage;
use crate::session::{ConnectionState, Session, SessionConfig, SessionError, SessionEvent};

/// Who caused a content change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOrigin {
    /// This client's own edit
    Local,
    /// Server state received on (re)connect
    Init,
    /// An update attributed to another user
    Remote(String),
}

/// Text before and after one applied change.
///
/// `previous` and `text` are what the selection remapper needs to move the
/// local cursor across a remote edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUpdate {
    pub doc_id: String,
    pub previous: String,
    pub text: String,
    pub origin: EditOrigin,
}

/// Events emitted by the document client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Content(ContentUpdate),
    Connection(ConnectionState),
    /// Current collaborators, excluding the local user
    Collaborators(Vec<String>),
    Error(SessionError),
}

/// Document client errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Text(#[from] TextError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("no document is open")]
    NoDocument,
    #[error("invalid server url: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Text(e) => e.kind(),
            ClientError::Session(e) => e.kind(),
            ClientError::NoDocument => ErrorKind::NotConnected,
            ClientError::InvalidUrl(_) => ErrorKind::Connection,
        }
    }
}

struct OpenDocument {
    doc_id: String,
    store: TextStore,
    collaborators: BTreeSet<String>,
}

impl OpenDocument {
    fn new(doc_id: &str) -> Self {
        Self {
            doc_id: doc_id.to_string(),
            store: TextStore::new(doc_id),
            collaborators: BTreeSet::new(),
        }
    }

    fn others(&self, me: &UserIdentity) -> Vec<String> {
        self.collaborators
            .iter()
            .filter(|id| id.as_str() != me.as_str())
            .cloned()
            .collect()
    }
}

type SharedDocument = Arc<Mutex<Option<OpenDocument>>>;

/// A collaborative editing client for one document at a time.
///
/// Must be created inside a Tokio runtime.
pub struct DocumentClient {
    server_url: String,
    identity: UserIdentity,
    session: Arc<Session>,
    document: SharedDocument,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    pump: JoinHandle<()>,
}

impl DocumentClient {
    pub fn new(server_url: impl Into<String>, identity: UserIdentity, config: SessionConfig) -> Self {
        let capacity = config.event_capacity;
        let mut session = Session::new(config);
        let session_events = session.take_event_rx();
        let session = Arc::new(session);

        let document: SharedDocument = Arc::new(Mutex::new(None));
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let pump = Pump {
            session: session.clone(),
            document: document.clone(),
            identity: identity.clone(),
            events: event_tx.clone(),
        };
        let pump = match session_events {
            Some(rx) => tokio::spawn(pump.run(rx)),
            None => tokio::spawn(async {}),
        };

        Self {
            server_url: server_url.into(),
            identity,
            session,
            document,
            event_tx,
            event_rx: Some(event_rx),
            pump,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Open `doc_id` and connect to it.
    ///
    /// Reopening the document that is already open keeps the local replica,
    /// so edits made while offline are sent after the server's `init`.
    pub async fn open(&self, doc_id: &str) -> Result<(), ClientError> {
        let url = self.connect_url(doc_id)?;
        {
            let mut document = self.document.lock().await;
            match document.as_ref() {
                Some(open) if open.doc_id == doc_id => {}
                _ => *document = Some(OpenDocument::new(doc_id)),
            }
        }
        self.session.connect(url.as_str()).await?;
        Ok(())
    }

    /// Reconnect to the currently open document.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let doc_id = self.doc_id().await.ok_or(ClientError::NoDocument)?;
        self.open(&doc_id).await
    }

    /// Disconnect and forget the open document.
    pub async fn close(&self) {
        self.session.disconnect().await;
        if let Some(doc) = self.document.lock().await.take() {
            log::info!("Closed document '{}'", doc.doc_id);
        }
    }

    /// Apply an editor change to the local replica and ship it if connected.
    ///
    /// Returns the CRDT-normalised result, also published as
    /// [`ClientEvent::Content`]. `Ok(None)` when `old == new`.
    pub async fn apply_local_edit(&self, old: &str, new: &str) -> Result<Option<ContentUpdate>, ClientError> {
        let mut document = self.document.lock().await;
        let doc = document.as_mut().ok_or(ClientError::NoDocument)?;

        let Some(edit) = translate(&mut doc.store, old, new)? else {
            return Ok(None);
        };
        let update = ContentUpdate {
            doc_id: doc.doc_id.clone(),
            previous: old.to_string(),
            text: edit.text,
            origin: EditOrigin::Local,
        };

        if self.session.state().await == ConnectionState::Connected {
            let msg = WireMessage::update(edit.update, self.identity.as_str());
            if let Err(e) = self.session.send(&msg).await {
                log::warn!("Edit on '{}' kept local until reconnect: {e}", doc.doc_id);
            }
        }
        drop(document);

        let _ = self.event_tx.send(ClientEvent::Content(update.clone())).await;
        Ok(Some(update))
    }

    /// Whether the editor should accept input.
    pub async fn accepts_input(&self) -> bool {
        self.session.state().await == ConnectionState::Connected
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.session.state().await
    }

    /// Collaborators on the open document, excluding this user.
    pub async fn collaborators(&self) -> Vec<String> {
        self.document
            .lock()
            .await
            .as_ref()
            .map(|doc| doc.others(&self.identity))
            .unwrap_or_default()
    }

    /// Current replica text of the open document.
    pub async fn text(&self) -> Option<String> {
        self.document.lock().await.as_ref().map(|doc| doc.store.current_text())
    }

    pub async fn doc_id(&self) -> Option<String> {
        self.document.lock().await.as_ref().map(|doc| doc.doc_id.clone())
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    fn connect_url(&self, doc_id: &str) -> Result<Url, ClientError> {
        let mut url = Url::parse(&self.server_url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("doc_id", doc_id)
            .append_pair("user_id", self.identity.as_str());
        Ok(url)
    }
}

impl Drop for DocumentClient {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Background task turning session events into replica changes.
struct Pump {
    session: Arc<Session>,
    document: SharedDocument,
    identity: UserIdentity,
    events: mpsc::Sender<ClientEvent>,
}

impl Pump {
    async fn run(self, mut rx: mpsc::Receiver<SessionEvent>) {
        while let Some(event) = rx.recv().await {
            let out = match event {
                SessionEvent::StateChanged(state) => vec![ClientEvent::Connection(state)],
                SessionEvent::Error(e) => vec![ClientEvent::Error(e)],
                SessionEvent::Message(msg) => self.on_message(msg).await,
            };
            for event in out {
                let _ = self.events.send(event).await;
            }
        }
    }

    async fn on_message(&self, msg: WireMessage) -> Vec<ClientEvent> {
        let mut document = self.document.lock().await;
        let Some(doc) = document.as_mut() else {
            log::debug!("Ignoring '{}' with no open document", msg.type_name());
            return Vec::new();
        };

        match msg {
            WireMessage::Init { content, collaborators } => {
                let mut out = Vec::new();
                doc.collaborators = collaborators.into_iter().collect();
                out.push(ClientEvent::Collaborators(doc.others(&self.identity)));

                let server_marker = match TextStore::from_update(doc.doc_id.as_str(), &content) {
                    Ok(server) => server.state_marker(),
                    Err(e) => {
                        log::warn!("Dropped init for '{}': {e}", doc.doc_id);
                        return out;
                    }
                };
                if let Some(update) = self.apply_remote(doc, &content, EditOrigin::Init) {
                    out.push(ClientEvent::Content(update));
                }
                self.catch_up(doc, &server_marker).await;
                out
            }

            WireMessage::Join { user_id } => {
                doc.collaborators.insert(user_id);
                vec![ClientEvent::Collaborators(doc.others(&self.identity))]
            }

            WireMessage::Leave { user_id } => {
                doc.collaborators.remove(&user_id);
                vec![ClientEvent::Collaborators(doc.others(&self.identity))]
            }

            WireMessage::Update { data, user_id } => {
                let mut out = Vec::new();
                if doc.collaborators.insert(user_id.clone()) {
                    out.push(ClientEvent::Collaborators(doc.others(&self.identity)));
                }
                if let Some(update) = self.apply_remote(doc, &data, EditOrigin::Remote(user_id)) {
                    out.push(ClientEvent::Content(update));
                }
                out
            }
        }
    }

    fn apply_remote(&self, doc: &mut OpenDocument, blob: &[u8], origin: EditOrigin) -> Option<ContentUpdate> {
        let previous = doc.store.current_text();
        if let Err(e) = doc.store.apply_remote(blob) {
            log::warn!("Dropped remote update for '{}': {e}", doc.doc_id);
            return None;
        }
        Some(ContentUpdate {
            doc_id: doc.doc_id.clone(),
            previous,
            text: doc.store.current_text(),
            origin,
        })
    }

    /// Send whatever the replica has that the server's `init` did not.
    async fn catch_up(&self, doc: &OpenDocument, server_marker: &StateMarker) {
        if doc.store.state_marker() == *server_marker {
            return;
        }
        let delta = doc.store.encode_delta_since(server_marker);
        log::info!(
            "Sending {} bytes of offline edits for '{}'",
            delta.len(),
            doc.doc_id
        );
        let msg = WireMessage::update(delta, self.identity.as_str());
        if let Err(e) = self.session.send(&msg).await {
            log::warn!("Catch-up for '{}' not sent: {e}", doc.doc_id);
        }
    }
}
