//! Client transport session: one WebSocket, one explicit state machine.
//!
//! ```text
//!                connect()             handshake ok
//!  Disconnected ──────────► Connecting ─────────────► Connected
//!       ▲                       │                         │
//!       │    handshake failed   │     disconnect() /      │
//!       └───────────────────────┴──── transport error ◄───┘
//! ```
//!
//! Everything the session observes is published on a single event stream
//! ([`SessionEvent`]): state changes, decoded inbound frames and classified
//! errors. Each connection attempt carries a generation number; a reader
//! task whose generation is stale, or whose state has left `Connected`,
//! never emits again.
//!
//! `disconnect()` moves to `Disconnected` before the socket is torn down, so
//! the close notification of our own teardown is not reported as a failure.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tandem_core::ErrorKind;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::protocol::{ProtocolError, WireMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Everything a session reports to its owner.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// A decoded frame from the server
    Message(WireMessage),
    Error(SessionError),
}

/// Session errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Handshake or transport failure
    #[error("connection failed: {0}")]
    Connection(String),
    /// Server closed the connection
    #[error("connection closed by server ({code}): {reason}")]
    Closed { code: u16, reason: String },
    #[error("session is not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Connection(_) | SessionError::Closed { .. } => ErrorKind::Connection,
            SessionError::NotConnected => ErrorKind::NotConnected,
            SessionError::Protocol(e) => e.kind(),
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Capacity of the event stream handed to the owner
    pub event_capacity: usize,
    /// Frames queued for the writer task before `send` waits
    pub outbound_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            event_capacity: 256,
            outbound_capacity: 256,
        }
    }
}

struct Link {
    generation: u64,
    outgoing: mpsc::Sender<Message>,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    /// Queue a close frame, stop the writer once it drains, optionally
    /// cancel the reader.
    fn shutdown(self, abort_reader: bool) {
        let _ = self.outgoing.try_send(Message::Close(None));
        if abort_reader {
            if let Some(reader) = self.reader {
                reader.abort();
            }
        }
    }
}

struct SessionInner {
    state: RwLock<ConnectionState>,
    generation: AtomicU64,
    event_tx: mpsc::Sender<SessionEvent>,
    link: Mutex<Option<Link>>,
    config: SessionConfig,
}

impl SessionInner {
    async fn emit(&self, event: SessionEvent) {
        // The owner may have dropped its receiver; nothing left to notify.
        let _ = self.event_tx.send(event).await;
    }

    async fn is_live(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
            && *self.state.read().await == ConnectionState::Connected
    }

    /// Emit `event` for connection `generation` unless it has been cancelled.
    ///
    /// A slot is reserved first; the liveness check and the send then happen
    /// under the state lock, so a `disconnect()` either lands before the
    /// check or waits until the event is queued. Returns whether it was sent.
    async fn emit_if_live(&self, generation: u64, event: SessionEvent) -> bool {
        let Ok(permit) = self.event_tx.reserve().await else {
            return false;
        };
        let state = self.state.read().await;
        if self.generation.load(Ordering::SeqCst) != generation || *state != ConnectionState::Connected {
            return false;
        }
        permit.send(event);
        true
    }

    /// Mid-session failure: report once, then drop the connection.
    async fn fail(&self, generation: u64, err: SessionError) {
        {
            let mut state = self.state.write().await;
            if self.generation.load(Ordering::SeqCst) != generation
                || *state == ConnectionState::Disconnected
            {
                return;
            }
            *state = ConnectionState::Disconnected;
        }

        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.shutdown(false);
        }

        log::warn!("Session lost: {err}");
        self.emit(SessionEvent::StateChanged(ConnectionState::Disconnected)).await;
        self.emit(SessionEvent::Error(err)).await;
    }

    async fn teardown(&self) {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.shutdown(true);
        }
    }
}

/// A reconnectable WebSocket session.
pub struct Session {
    inner: Arc<SessionInner>,
    event_rx: Option<mpsc::Receiver<SessionEvent>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            inner: Arc::new(SessionInner {
                state: RwLock::new(ConnectionState::Disconnected),
                generation: AtomicU64::new(0),
                event_tx,
                link: Mutex::new(None),
                config,
            }),
            event_rx: Some(event_rx),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SessionConfig::default())
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.take()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    /// Connect to `url`, replacing any previous connection.
    ///
    /// A handshake failure leaves the session `Disconnected` and is both
    /// returned and published as [`SessionEvent::Error`].
    pub async fn connect(&self, url: &str) -> Result<(), SessionError> {
        let inner = &self.inner;
        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        inner.teardown().await;

        *inner.state.write().await = ConnectionState::Connecting;
        inner.emit(SessionEvent::StateChanged(ConnectionState::Connecting)).await;
        log::debug!("Connecting to {url}");

        let ws = match tokio_tungstenite::connect_async(url).await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                let err = SessionError::Connection(e.to_string());
                let current = {
                    let mut state = inner.state.write().await;
                    let current = inner.generation.load(Ordering::SeqCst) == generation;
                    if current {
                        *state = ConnectionState::Disconnected;
                    }
                    current
                };
                if current {
                    log::warn!("Connection to {url} failed: {e}");
                    inner.emit(SessionEvent::StateChanged(ConnectionState::Disconnected)).await;
                    inner.emit(SessionEvent::Error(err.clone())).await;
                }
                return Err(err);
            }
        };

        let (sink, stream) = ws.split();
        let (out_tx, out_rx) = mpsc::channel(inner.config.outbound_capacity);
        {
            let mut state = inner.state.write().await;
            if inner.generation.load(Ordering::SeqCst) != generation {
                // Superseded by disconnect() or another connect().
                return Err(SessionError::Connection("connection attempt cancelled".into()));
            }
            tokio::spawn(write_loop(sink, out_rx));
            *inner.link.lock().await = Some(Link {
                generation,
                outgoing: out_tx,
                reader: None,
            });
            *state = ConnectionState::Connected;
        }

        log::info!("Connected to {url}");
        inner.emit(SessionEvent::StateChanged(ConnectionState::Connected)).await;

        let reader = tokio::spawn(read_loop(inner.clone(), generation, stream));
        let mut link = inner.link.lock().await;
        match link.as_mut() {
            Some(link) if link.generation == generation => link.reader = Some(reader),
            _ => reader.abort(),
        }
        Ok(())
    }

    /// Close the connection without reporting it as an error.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.generation.fetch_add(1, Ordering::SeqCst);
        let previous = std::mem::replace(&mut *inner.state.write().await, ConnectionState::Disconnected);
        inner.teardown().await;

        if previous != ConnectionState::Disconnected {
            log::info!("Session disconnected");
            inner.emit(SessionEvent::StateChanged(ConnectionState::Disconnected)).await;
        }
    }

    /// Queue a frame for sending. Rejected unless `Connected`.
    pub async fn send(&self, msg: &WireMessage) -> Result<(), SessionError> {
        if self.state().await != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let frame = msg.encode()?;

        let outgoing = self
            .inner
            .link
            .lock()
            .await
            .as_ref()
            .map(|link| link.outgoing.clone())
            .ok_or(SessionError::NotConnected)?;
        outgoing
            .send(Message::text(frame))
            .await
            .map_err(|_| SessionError::NotConnected)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Ok(mut link) = self.inner.link.try_lock() {
            if let Some(link) = link.take() {
                link.shutdown(true);
            }
        }
    }
}

async fn write_loop(
    mut sink: futures_util::stream::SplitSink<WsStream, Message>,
    mut rx: mpsc::Receiver<Message>,
) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() || closing {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_loop(inner: Arc<SessionInner>, generation: u64, mut stream: SplitStream<WsStream>) {
    while let Some(msg) = stream.next().await {
        if !inner.is_live(generation).await {
            return;
        }
        let decoded = match msg {
            Ok(Message::Text(text)) => WireMessage::decode(text.as_str()),
            Ok(Message::Binary(data)) => WireMessage::decode_bytes(&data),
            Ok(Message::Close(frame)) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                    .unwrap_or((1005, String::new()));
                inner.fail(generation, SessionError::Closed { code, reason }).await;
                return;
            }
            Ok(_) => continue,
            Err(e) => {
                inner.fail(generation, SessionError::Connection(e.to_string())).await;
                return;
            }
        };

        match decoded {
            Ok(msg) => {
                if !inner.emit_if_live(generation, SessionEvent::Message(msg)).await {
                    return;
                }
            }
            Err(e) => log::warn!("Dropped malformed frame from server: {e}"),
        }
    }

    inner
        .fail(generation, SessionError::Connection("connection reset".into()))
        .await;
}
