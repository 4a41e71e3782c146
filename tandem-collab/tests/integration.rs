//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real server and connect real clients,
//! verifying the full sync pipeline.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tandem_collab::client::{ClientEvent, DocumentClient, EditOrigin};
use tandem_collab::identity::UserIdentity;
use tandem_collab::protocol::WireMessage;
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::session::{ConnectionState, Session, SessionConfig, SessionError, SessionEvent};
use tandem_core::{remap_selection_for_texts, ErrorKind, Selection, TextStore};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on `port` with in-memory snapshots.
async fn start_server_on(port: u16) -> Arc<SyncServer> {
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        broadcast_capacity: 64,
        ..ServerConfig::default()
    };
    let server = Arc::new(SyncServer::new(config).unwrap());
    let running = server.clone();
    tokio::spawn(async move {
        running.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    server
}

/// Start a server on a free port, return the port.
async fn start_test_server() -> (u16, Arc<SyncServer>) {
    let port = free_port().await;
    let server = start_server_on(port).await;
    (port, server)
}

fn ws_url(port: u16) -> String {
    format!("ws://127.0.0.1:{port}/websocket")
}

async fn connect(port: u16, doc_id: &str, user_id: &str) -> Ws {
    let url = format!("{}?doc_id={doc_id}&user_id={user_id}", ws_url(port));
    let (ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws
}

/// Next text frame, raw.
async fn next_text(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        if let Message::Text(text) = msg {
            return text.as_str().to_string();
        }
    }
}

async fn next_message(ws: &mut Ws) -> WireMessage {
    WireMessage::decode(&next_text(ws).await).unwrap()
}

async fn assert_silent(ws: &mut Ws, millis: u64) {
    if let Ok(Some(Ok(msg))) = timeout(Duration::from_millis(millis), ws.next()).await {
        panic!("expected no frame, got {msg:?}");
    }
}

fn expect_init(msg: WireMessage) -> (String, Vec<String>) {
    match msg {
        WireMessage::Init { content, collaborators } => {
            let text = TextStore::from_update("d1", &content).unwrap().current_text();
            (text, collaborators)
        }
        other => panic!("expected init, got {other:?}"),
    }
}

fn update_for(text: &str, user: &str) -> String {
    let mut store = TextStore::new("d1");
    store.insert(0, text).unwrap();
    WireMessage::update(store.encode_full_state(), user).encode().unwrap()
}

/// Send a raw HTTP request and return the whole response.
async fn raw_request(port: u16, request: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    timeout(Duration::from_secs(2), stream.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    response
}

/// Accept a single connection, send it an `init`, then end it once
/// triggered: with `close` as the close frame, or by dropping the socket.
async fn start_one_shot_server(close: Option<CloseFrame>) -> (u16, oneshot::Sender<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (trigger, fired) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let init = WireMessage::init(TextStore::new("d1").encode_full_state(), vec!["alice".to_string()]);
        ws.send(Message::text(init.encode().unwrap())).await.unwrap();
        let _ = fired.await;
        if let Some(frame) = close {
            let _ = ws.close(Some(frame)).await;
            // Wait for the client's reply so the close completes cleanly.
            while let Some(Ok(_)) = ws.next().await {}
        }
    });
    (port, trigger)
}

async fn next_event(events: &mut mpsc::Receiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event stream closed")
}

async fn wait_for_text(client: &DocumentClient, expected: &str) {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if client.text().await.as_deref() == Some(expected) {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "text is {:?}, expected {expected:?}",
            client.text().await
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ─── Coordinator over the wire ───────────────────────────────────────────────

#[tokio::test]
async fn test_join_update_leave_scenario() {
    let (port, _server) = start_test_server().await;

    let mut a = connect(port, "d1", "A").await;
    let (text, roster) = expect_init(next_message(&mut a).await);
    assert_eq!(text, "");
    assert_eq!(roster, vec!["A"]);

    let mut b = connect(port, "d1", "B").await;
    assert_eq!(next_message(&mut a).await, WireMessage::join("B"));
    let (_, roster) = expect_init(next_message(&mut b).await);
    assert_eq!(roster, vec!["A", "B"]);

    let frame = update_for("hi", "A");
    a.send(Message::text(frame.clone())).await.unwrap();
    assert_eq!(next_text(&mut b).await, frame, "update must be relayed verbatim");
    assert_silent(&mut a, 200).await;

    b.close(None).await.unwrap();
    assert_eq!(next_message(&mut a).await, WireMessage::leave("B"));
}

#[tokio::test]
async fn test_late_joiner_gets_current_state() {
    let (port, server) = start_test_server().await;

    let mut a = connect(port, "d1", "A").await;
    let _ = next_message(&mut a).await;
    a.send(Message::text(update_for("shared", "A"))).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut c = connect(port, "d1", "C").await;
    let (text, roster) = expect_init(next_message(&mut c).await);
    assert_eq!(text, "shared");
    assert_eq!(roster, vec!["A", "C"]);
    assert_eq!(server.stats().active_connections, 2);
}

#[tokio::test]
async fn test_binary_frames_are_relayed_verbatim() {
    let (port, _server) = start_test_server().await;
    let mut a = connect(port, "d1", "A").await;
    let _ = next_message(&mut a).await; // init
    let mut b = connect(port, "d1", "B").await;
    let _ = next_message(&mut a).await; // join B
    let _ = next_message(&mut b).await; // init

    let frame = update_for("bin", "B");
    b.send(Message::binary(frame.clone().into_bytes())).await.unwrap();

    let msg = timeout(Duration::from_secs(2), a.next())
        .await
        .expect("timed out waiting for a frame")
        .expect("stream ended")
        .unwrap();
    match msg {
        Message::Binary(data) => assert_eq!(&data[..], frame.as_bytes()),
        other => panic!("expected a binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let (port, server) = start_test_server().await;
    let mut a = connect(port, "d1", "A").await;
    let _ = next_message(&mut a).await;
    let mut b = connect(port, "d1", "B").await;
    let _ = next_message(&mut a).await;
    let _ = next_message(&mut b).await;

    b.send(Message::text("{not json".to_string())).await.unwrap();
    b.send(Message::text(r#"{"type":"update","data":[300],"userId":"B"}"#.to_string()))
        .await
        .unwrap();
    b.send(Message::text(r#"{"type":"leave","userId":"A"}"#.to_string())).await.unwrap();

    let frame = update_for("still here", "B");
    b.send(Message::text(frame.clone())).await.unwrap();
    assert_eq!(next_text(&mut a).await, frame);
    assert_eq!(server.stats().frames_received, 4);
}

#[tokio::test]
async fn test_ping_is_answered_without_broadcast() {
    let (port, _server) = start_test_server().await;
    let mut a = connect(port, "d1", "A").await;
    let _ = next_message(&mut a).await;
    let mut b = connect(port, "d1", "B").await;
    let _ = next_message(&mut a).await;
    let _ = next_message(&mut b).await;

    b.send(Message::text("ping".to_string())).await.unwrap();
    assert_eq!(next_text(&mut b).await, "pong");
    assert_silent(&mut a, 200).await;
}

#[tokio::test]
async fn test_documents_do_not_leak() {
    let (port, _server) = start_test_server().await;
    let mut a = connect(port, "d1", "A").await;
    let mut b = connect(port, "d2", "B").await;
    let _ = next_message(&mut a).await;
    let _ = next_message(&mut b).await;

    b.send(Message::text(update_for("elsewhere", "B"))).await.unwrap();
    assert_silent(&mut a, 200).await;
}

// ─── Handshake ───────────────────────────────────────────────────────────────

const UPGRADE_HEADERS: &str = "Host: localhost\r\n\
    Connection: Upgrade\r\n\
    Upgrade: websocket\r\n\
    Sec-WebSocket-Version: 13\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n";

#[tokio::test]
async fn test_handshake_rejections() {
    let (port, server) = start_test_server().await;

    let response = raw_request(port, &format!("GET /other?doc_id=d&user_id=u HTTP/1.1\r\n{UPGRADE_HEADERS}")).await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.ends_with("Supported endpoints: /websocket: Expects a WebSocket upgrade request"));

    let response = raw_request(
        port,
        "GET /websocket?doc_id=d&user_id=u HTTP/1.1\r\nHost: localhost\r\n\r\n",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 426"), "{response}");
    assert!(response.ends_with("Expected Upgrade: websocket"));

    let response = raw_request(port, &format!("POST /websocket?doc_id=d&user_id=u HTTP/1.1\r\n{UPGRADE_HEADERS}")).await;
    assert!(response.ends_with("Expected GET method"), "{response}");

    let response = raw_request(port, &format!("GET /websocket?doc_id=d HTTP/1.1\r\n{UPGRADE_HEADERS}")).await;
    assert!(response.ends_with("User id is required."), "{response}");

    let response = raw_request(port, &format!("GET /websocket?user_id=u HTTP/1.1\r\n{UPGRADE_HEADERS}")).await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(response.ends_with("Doc id is required."));

    assert_eq!(server.stats().rejected_handshakes, 5);
    assert_eq!(server.stats().total_connections, 0);
}

#[tokio::test]
async fn test_rejected_handshake_fails_client_connect() {
    let (port, _server) = start_test_server().await;
    let url = format!("{}?doc_id=d1", ws_url(port));
    assert!(tokio_tungstenite::connect_async(&url).await.is_err());
}

// ─── Client side ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_session_lifecycle() {
    let (port, _server) = start_test_server().await;
    let mut session = Session::new(SessionConfig::default());
    let mut events = session.take_event_rx().unwrap();

    session
        .connect(&format!("{}?doc_id=d1&user_id=alice", ws_url(port)))
        .await
        .unwrap();
    assert_eq!(session.state().await, ConnectionState::Connected);

    let mut saw_init = false;
    while let Ok(Some(event)) = timeout(Duration::from_millis(500), events.recv()).await {
        if let SessionEvent::Message(WireMessage::Init { collaborators, .. }) = event {
            assert_eq!(collaborators, vec!["alice"]);
            saw_init = true;
            break;
        }
    }
    assert!(saw_init);

    session.disconnect().await;
    assert_eq!(session.state().await, ConnectionState::Disconnected);

    // Our own teardown is not reported as a failure.
    while let Ok(Some(event)) = timeout(Duration::from_millis(300), events.recv()).await {
        assert!(!matches!(event, SessionEvent::Error(_)), "unexpected {event:?}");
    }
    assert!(session.send(&WireMessage::join("alice")).await.is_err());
}

#[tokio::test]
async fn test_server_close_mid_session_reported_once() {
    let close = CloseFrame {
        code: CloseCode::Away,
        reason: "shutting down".into(),
    };
    let (port, trigger) = start_one_shot_server(Some(close)).await;
    let mut session = Session::new(SessionConfig::default());
    let mut events = session.take_event_rx().unwrap();

    session
        .connect(&format!("{}?doc_id=d1&user_id=alice", ws_url(port)))
        .await
        .unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::StateChanged(ConnectionState::Connecting)
    ));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::StateChanged(ConnectionState::Connected)
    ));
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::Message(WireMessage::Init { .. })
    ));

    trigger.send(()).unwrap();
    assert!(matches!(
        next_event(&mut events).await,
        SessionEvent::StateChanged(ConnectionState::Disconnected)
    ));
    match next_event(&mut events).await {
        SessionEvent::Error(err) => {
            assert_eq!(
                err,
                SessionError::Closed {
                    code: 1001,
                    reason: "shutting down".to_string()
                }
            );
            assert_eq!(err.kind(), ErrorKind::Connection);
        }
        other => panic!("expected an error, got {other:?}"),
    }

    // The reader is gone: nothing more arrives and sending is refused.
    assert!(timeout(Duration::from_millis(300), events.recv()).await.is_err());
    assert_eq!(session.state().await, ConnectionState::Disconnected);
    assert_eq!(
        session.send(&WireMessage::join("alice")).await,
        Err(SessionError::NotConnected)
    );
}

#[tokio::test]
async fn test_dropped_connection_surfaces_in_document_client() {
    let (port, trigger) = start_one_shot_server(None).await;
    let mut client = DocumentClient::new(ws_url(port), UserIdentity::from("alice"), SessionConfig::default());
    let mut events = client.take_event_rx().unwrap();

    client.open("d1").await.unwrap();
    assert!(client.accepts_input().await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    trigger.send(()).unwrap();

    let err = loop {
        match timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
            Some(ClientEvent::Error(err)) => break err,
            Some(_) => continue,
            None => panic!("event stream closed"),
        }
    };
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert!(!client.accepts_input().await);

    // Reported once; the local replica is still there for offline edits.
    while let Ok(Some(event)) = timeout(Duration::from_millis(300), events.recv()).await {
        assert!(!matches!(event, ClientEvent::Error(_)), "unexpected {event:?}");
    }
    client.apply_local_edit("", "offline").await.unwrap();
    assert_eq!(client.text().await.as_deref(), Some("offline"));
}

#[tokio::test]
async fn test_reconnect_replaces_connection() {
    let (port, server) = start_test_server().await;
    let session = Session::new(SessionConfig::default());
    let url = format!("{}?doc_id=d1&user_id=alice", ws_url(port));

    session.connect(&url).await.unwrap();
    session.connect(&url).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(server.stats().active_connections, 1);
    assert_eq!(server.registry().roster("d1").await, vec!["alice"]);
}

#[tokio::test]
async fn test_document_clients_converge() {
    let (port, _server) = start_test_server().await;

    let mut alice = DocumentClient::new(ws_url(port), UserIdentity::from("alice"), SessionConfig::default());
    let mut bob = DocumentClient::new(ws_url(port), UserIdentity::from("bob"), SessionConfig::default());
    let _alice_events = alice.take_event_rx().unwrap();
    let mut bob_events = bob.take_event_rx().unwrap();

    alice.open("d1").await.unwrap();
    bob.open("d1").await.unwrap();
    assert!(alice.accepts_input().await);
    wait_for_text(&alice, "").await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.apply_local_edit("", "hello").await.unwrap();
    wait_for_text(&bob, "hello").await;

    assert_eq!(alice.collaborators().await, vec!["bob"]);
    assert_eq!(bob.collaborators().await, vec!["alice"]);

    // Bob's editor gets enough to move its cursor across the remote edit.
    let remote = loop {
        match timeout(Duration::from_secs(2), bob_events.recv()).await.unwrap() {
            Some(ClientEvent::Content(update)) if update.origin == EditOrigin::Remote("alice".into()) => {
                break update
            }
            Some(_) => continue,
            None => panic!("event stream closed"),
        }
    };
    assert_eq!(remote.previous, "");
    assert_eq!(remote.text, "hello");

    bob.apply_local_edit("hello", "hXello").await.unwrap();
    wait_for_text(&alice, "hXello").await;
    let moved = remap_selection_for_texts(Selection::new(2, 4), "hello", "hXello");
    assert_eq!(moved, Selection::new(3, 5));

    bob.close().await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while !alice.collaborators().await.is_empty() {
        assert!(Instant::now() < deadline, "bob never left");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_offline_edits_caught_up_on_reconnect() {
    let port = free_port().await;

    let mut writer = DocumentClient::new(ws_url(port), UserIdentity::from("writer"), SessionConfig::default());
    let _events = writer.take_event_rx().unwrap();

    // Server not up yet: the edit stays in the local replica.
    assert!(writer.open("d1").await.is_err());
    assert!(!writer.accepts_input().await);
    writer.apply_local_edit("", "written offline").await.unwrap();

    let _server = start_server_on(port).await;
    writer.reconnect().await.unwrap();

    let mut reader = connect(port, "d1", "reader").await;
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let (text, _) = expect_init(next_message(&mut reader).await);
        if text == "written offline" {
            break;
        }
        assert!(Instant::now() < deadline, "offline edit never reached the server");
        reader.close(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        reader = connect(port, "d1", "reader").await;
    }
    assert_eq!(writer.text().await.as_deref(), Some("written offline"));
}
