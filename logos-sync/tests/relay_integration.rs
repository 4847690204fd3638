//! Integration tests for sessions talking through the WebSocket relay.
//!
//! These tests start a real relay on an ephemeral port and connect two
//! clients with `WsTransport`, verifying presence, operations and cursors
//! across the full network stack.

use futures_util::{SinkExt, StreamExt};
use logos_sync::protocol::RelayFrame;
use logos_sync::{
    CollabClient, CursorPosition, Identity, MemoryStore, Operation, RelayConfig, RelayServer,
    ResourceType, Room, RoomOptions, StaticIdentity, UserId, WsTransport,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Start a relay on a free port, return its URL and a handle for stats.
async fn start_test_relay() -> (String, Arc<RelayServer>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = Arc::new(RelayServer::new(RelayConfig::for_testing()));
    let serving = relay.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), relay)
}

fn ws_client(url: &str, store: &Arc<MemoryStore>, name: &str) -> (CollabClient, UserId) {
    let user_id = Uuid::new_v4();
    let client = CollabClient::new(
        store.clone(),
        Arc::new(WsTransport::new(url).with_handshake_timeout(Duration::from_secs(2))),
        Arc::new(StaticIdentity::new(Identity::new(user_id, name))),
    );
    (client, user_id)
}

async fn joined_pair(url: &str) -> (CollabClient, UserId, CollabClient, UserId, Room) {
    let store = Arc::new(MemoryStore::new());
    let (mut x, x_id) = ws_client(url, &store, "Xavier");
    let (mut y, y_id) = ws_client(url, &store, "Yara");

    let room = x
        .create_room(ResourceType::Design, "brochure", "Brochure", RoomOptions::default())
        .await
        .unwrap();
    x.join_room(room.id).await.unwrap();
    y.join_room(room.id).await.unwrap();

    // Let presence frames settle on both sides
    x.run_for(Duration::from_millis(150)).await;
    y.run_for(Duration::from_millis(150)).await;
    (x, x_id, y, y_id, room)
}

// ─── Presence ────────────────────────────────────────────────────

#[tokio::test]
async fn test_presence_over_relay() {
    let (url, _relay) = start_test_relay().await;
    let (mut x, x_id, mut y, y_id, _room) = joined_pair(&url).await;

    let mut seen: Vec<UserId> = y.participants().iter().map(|p| p.user_id).collect();
    seen.sort();
    let mut expected = vec![x_id, y_id];
    expected.sort();
    assert_eq!(seen, expected);

    x.leave_room().await.unwrap();
    y.run_for(Duration::from_millis(200)).await;
    let remaining: Vec<UserId> = y.participants().iter().map(|p| p.user_id).collect();
    assert_eq!(remaining, vec![y_id]);
}

#[tokio::test]
async fn test_cursor_over_relay() {
    let (url, _relay) = start_test_relay().await;
    let (mut x, x_id, mut y, _, _room) = joined_pair(&url).await;

    x.update_cursor(CursorPosition::new(10.0, 20.0)).unwrap();
    x.update_cursor(CursorPosition::new(11.0, 21.0)).unwrap();
    // Drives the throttle past its window
    x.run_for(Duration::from_millis(50)).await;

    y.run_for(Duration::from_millis(200)).await;
    assert_eq!(y.cursors().get(&x_id), Some(&CursorPosition::new(11.0, 21.0)));
}

// ─── Operations ──────────────────────────────────────────────────

#[tokio::test]
async fn test_operation_over_relay() {
    let (url, _relay) = start_test_relay().await;
    let (mut x, x_id, mut y, _, _room) = joined_pair(&url).await;

    let received: Arc<Mutex<Vec<Operation>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    y.observers()
        .operation
        .subscribe(move |op: &Operation| sink.lock().unwrap().push(op.clone()));

    let sent = x
        .send_operation("create", "image", json!({"src": "hero.png"}), Some(Uuid::new_v4()))
        .await
        .unwrap();
    y.run_for(Duration::from_millis(200)).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, sent.id);
    assert_eq!(y.clock().get(&x_id), 1);
}

// ─── Relay ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_relay_rejects_bad_handshake() {
    let (url, _relay) = start_test_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    // Publish before Subscribe is a protocol error
    let frame = RelayFrame::Publish(vec![1, 2, 3]).encode().unwrap();
    ws.send(Message::Binary(frame.into())).await.unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("relay replied in time")
        .expect("stream open")
        .unwrap();
    match reply {
        Message::Binary(data) => {
            assert!(matches!(RelayFrame::decode(&data), Ok(RelayFrame::Error(_))));
        }
        other => panic!("expected an error frame, got {other:?}"),
    }
}

#[tokio::test]
async fn test_relay_stats_count_connections() {
    let (url, relay) = start_test_relay().await;
    let (_x, _, _y, _, _room) = joined_pair(&url).await;

    let stats = relay.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.active_connections, 2);
    assert_eq!(stats.hub.rooms, 1);
    assert!(stats.frames_in >= 2, "both clients tracked presence");
    assert!(stats.frames_out > 0);
}
