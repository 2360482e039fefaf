// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, connect_async, MaybeTlsStream, WebSocketStream};

use chat_relay::auth::HmacTokenVerifier;
use chat_relay::handler::{self, ConnectionDeps};
use chat_relay::metrics::RelayMetrics;
use chat_relay::presence::PresenceDirectory;
use chat_relay::rate_limit::RateLimiter;
use chat_relay::store::{MemoryMessageStore, MessageStore};
use chat_relay::users::{MemoryUserDirectory, UserDirectory, UserProfile};

pub const TEST_SECRET: &[u8] = b"relay-integration-test-secret";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A running relay accepting any number of WebSocket connections.
pub struct TestServer {
    pub url: String,
    pub presence: Arc<PresenceDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub verifier: Arc<HmacTokenVerifier>,
}

impl TestServer {
    /// Mints a valid token for `user_id`.
    pub fn token_for(&self, user_id: &str) -> String {
        self.verifier.issue(user_id, Duration::from_secs(3600))
    }
}

/// Starts a relay backed by an in-memory message store, with profiles for
/// alice and bob preloaded.
#[allow(dead_code)]
pub async fn start_server() -> TestServer {
    start_server_with_store(Arc::new(MemoryMessageStore::new())).await
}

/// Starts a relay over the given message store.
#[allow(dead_code)]
pub async fn start_server_with_store(messages: Arc<dyn MessageStore>) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://127.0.0.1:{}", addr.port());

    let presence = Arc::new(PresenceDirectory::new());
    let verifier = Arc::new(HmacTokenVerifier::new(TEST_SECRET));
    let users: Arc<dyn UserDirectory> = Arc::new(MemoryUserDirectory::new());
    users.upsert(UserProfile {
        user_id: "alice".to_string(),
        username: Some("Alice".to_string()),
    });
    users.upsert(UserProfile {
        user_id: "bob".to_string(),
        username: Some("Bob".to_string()),
    });
    let rate_limiter = Arc::new(RateLimiter::new(600));
    let metrics = RelayMetrics::new();

    {
        let presence = presence.clone();
        let messages = messages.clone();
        let verifier = verifier.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let deps = ConnectionDeps {
                    presence: presence.clone(),
                    messages: messages.clone(),
                    users: users.clone(),
                    verifier: verifier.clone(),
                    rate_limiter: rate_limiter.clone(),
                    metrics: metrics.clone(),
                    max_message_size: 65_536,
                    max_text_chars: 5000,
                    idle_timeout: Duration::from_secs(5),
                };
                tokio::spawn(async move {
                    if let Ok(ws) = accept_async(stream).await {
                        handler::handle_connection(ws, deps).await;
                    }
                });
            }
        });
    }

    TestServer {
        url,
        presence,
        messages,
        verifier,
    }
}

/// Connects a WebSocket client to the server.
#[allow(dead_code)]
pub async fn connect(server: &TestServer) -> WsClient {
    let (ws, _) = connect_async(&server.url).await.unwrap();
    ws
}

// ============================================================================
// Protocol helpers (external perspective, validates the wire format)
// ============================================================================

const FRAME_HEADER_SIZE: usize = 4;

/// Encodes a JSON value into a binary frame (4-byte BE length prefix + JSON).
#[allow(dead_code)]
pub fn encode_envelope(envelope: &Value) -> Vec<u8> {
    let json = serde_json::to_vec(envelope).unwrap();
    let len = json.len() as u32;
    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + json.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&json);
    frame
}

/// Decodes a binary frame back to a JSON value.
#[allow(dead_code)]
pub fn decode_envelope(data: &[u8]) -> Value {
    assert!(data.len() >= FRAME_HEADER_SIZE, "Frame too short");
    let json = &data[FRAME_HEADER_SIZE..];
    serde_json::from_slice(json).unwrap()
}

fn envelope(payload: Value) -> Value {
    json!({
        "version": 1,
        "message_id": uuid::Uuid::new_v4().to_string(),
        "timestamp": 1000,
        "payload": payload
    })
}

/// Builds a Join envelope.
#[allow(dead_code)]
pub fn make_join(token: &str, user_id: &str) -> Value {
    envelope(json!({
        "type": "Join",
        "token": token,
        "user_id": user_id
    }))
}

/// Builds a SendMessage envelope.
#[allow(dead_code)]
pub fn make_send(sender_id: &str, receiver_id: &str, text: &str, token: &str) -> Value {
    envelope(json!({
        "type": "SendMessage",
        "sender_id": sender_id,
        "receiver_id": receiver_id,
        "text": text,
        "token": token
    }))
}

/// Builds a Typing envelope.
#[allow(dead_code)]
pub fn make_typing(receiver_id: &str, is_typing: bool) -> Value {
    envelope(json!({
        "type": "Typing",
        "receiver_id": receiver_id,
        "is_typing": is_typing
    }))
}

// ============================================================================
// Send/receive helpers
// ============================================================================

/// Sends one envelope as a binary frame.
#[allow(dead_code)]
pub async fn send_msg(ws: &mut WsClient, msg: &Value) {
    ws.send(Message::Binary(encode_envelope(msg)))
        .await
        .unwrap();
}

/// Receives the next binary message as JSON.
#[allow(dead_code)]
pub async fn recv(ws: &mut WsClient) -> Value {
    let msg = timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("Timeout waiting for message")
        .expect("Stream ended")
        .expect("WebSocket error");

    match msg {
        Message::Binary(data) => decode_envelope(&data),
        other => panic!("Expected Binary message, got {:?}", other),
    }
}

/// Try to receive a message with a short timeout. Returns None if no message
/// arrives.
#[allow(dead_code)]
pub async fn try_recv(ws: &mut WsClient) -> Option<Value> {
    match timeout(Duration::from_millis(200), ws.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => Some(decode_envelope(&data)),
        _ => None,
    }
}

/// Receives events until one of the given payload type arrives, skipping
/// unrelated broadcasts. Panics after 10 unrelated events.
#[allow(dead_code)]
pub async fn recv_until(ws: &mut WsClient, payload_type: &str) -> Value {
    for _ in 0..10 {
        let event = recv(ws).await;
        if event["payload"]["type"] == payload_type {
            return event;
        }
    }
    panic!("No {} event within 10 events", payload_type);
}

/// Collects every event that arrives within the try_recv window.
#[allow(dead_code)]
pub async fn drain(ws: &mut WsClient) -> Vec<Value> {
    let mut events = Vec::new();
    while let Some(event) = try_recv(ws).await {
        events.push(event);
    }
    events
}

/// Joins as `user_id` with a valid token and drains the Joined ack plus the
/// connection's own UserOnline broadcast.
#[allow(dead_code)]
pub async fn join_as(ws: &mut WsClient, server: &TestServer, user_id: &str) {
    let token = server.token_for(user_id);
    send_msg(ws, &make_join(&token, user_id)).await;

    let joined = recv_until(ws, "Joined").await;
    assert_eq!(joined["payload"]["user_id"], user_id);

    let online = recv_until(ws, "UserOnline").await;
    assert_eq!(online["payload"]["user_id"], user_id);
}
