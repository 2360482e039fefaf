// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! WebSocket Connection Handler
//!
//! Owns one client connection from accept to disconnect: drives the join
//! handshake, dispatches message and typing events, and cleans up presence
//! on exit.
//!
//! Authentication is per-operation where the protocol says so: join verifies
//! its token once, but every send carries and re-verifies its own token. The
//! session's joined state is deliberately not sufficient for sending.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::auth::TokenVerifier;
use crate::metrics::RelayMetrics;
use crate::presence::{PresenceDirectory, PresenceMessage};
use crate::rate_limit::RateLimiter;
use crate::store::{MessageStore, NewMessage};
use crate::users::UserDirectory;

/// Wire protocol message types.
pub mod protocol {
    use serde::{Deserialize, Serialize};

    use crate::store::StoredMessage;
    use crate::users::UserProfile;

    pub const PROTOCOL_VERSION: u8 = 1;
    pub const FRAME_HEADER_SIZE: usize = 4;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MessageEnvelope {
        pub version: u8,
        pub message_id: String,
        pub timestamp: u64,
        pub payload: MessagePayload,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum MessagePayload {
        // Client → server
        Join(Join),
        SendMessage(SendMessage),
        Typing(Typing),
        // Server → client
        Joined(Joined),
        UserOnline(UserOnline),
        MessageSent(MessageSent),
        ReceiveMessage(ReceiveMessage),
        UserTyping(UserTyping),
        UserOffline(UserOffline),
        Error(ErrorEvent),
        #[serde(other)]
        Unknown,
    }

    /// Authenticate and register presence.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Join {
        pub token: String,
        pub user_id: String,
    }

    /// Send a message: persist, acknowledge, relay if the recipient is online.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SendMessage {
        pub sender_id: String,
        pub receiver_id: String,
        pub text: String,
        pub token: String,
    }

    /// Ephemeral typing indicator; no persistence, no acknowledgment.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Typing {
        pub receiver_id: String,
        pub is_typing: bool,
    }

    /// Join accepted.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Joined {
        pub message: String,
        pub user_id: String,
    }

    /// Presence announcement, broadcast to every connection.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct UserOnline {
        pub user_id: String,
    }

    /// Delivery acknowledgment to the sender.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MessageSent {
        pub success: bool,
        pub data: MessageRecord,
    }

    /// Real-time delivery to an online recipient.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ReceiveMessage {
        pub data: MessageRecord,
    }

    /// Forwarded typing indicator.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct UserTyping {
        pub user_id: String,
        pub is_typing: bool,
    }

    /// Presence announcement, broadcast to every connection.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct UserOffline {
        pub user_id: String,
    }

    /// Any failure in the above; only ever sent to the failing connection.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ErrorEvent {
        pub message: String,
        #[serde(default)]
        pub error: Option<String>,
    }

    /// A stored message with populated participant profiles, as it appears
    /// on the wire.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MessageRecord {
        pub id: String,
        pub sender: UserProfile,
        pub receiver: UserProfile,
        pub text: String,
        /// Creation time in Unix milliseconds.
        pub timestamp: u64,
        pub is_read: bool,
    }

    impl MessageRecord {
        /// Builds the wire record for a stored message.
        pub fn new(msg: &StoredMessage, sender: UserProfile, receiver: UserProfile) -> Self {
            MessageRecord {
                id: msg.id.clone(),
                sender,
                receiver,
                text: msg.text.clone(),
                timestamp: msg.timestamp_ms,
                is_read: msg.is_read,
            }
        }
    }

    fn envelope(payload: MessagePayload) -> MessageEnvelope {
        MessageEnvelope {
            version: PROTOCOL_VERSION,
            message_id: uuid::Uuid::new_v4().to_string(),
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            payload,
        }
    }

    /// Creates a join acknowledgment envelope.
    pub fn create_joined(user_id: &str) -> MessageEnvelope {
        envelope(MessagePayload::Joined(Joined {
            message: "Successfully connected".to_string(),
            user_id: user_id.to_string(),
        }))
    }

    /// Creates an online presence announcement.
    pub fn create_user_online(user_id: &str) -> MessageEnvelope {
        envelope(MessagePayload::UserOnline(UserOnline {
            user_id: user_id.to_string(),
        }))
    }

    /// Creates an offline presence announcement.
    pub fn create_user_offline(user_id: &str) -> MessageEnvelope {
        envelope(MessagePayload::UserOffline(UserOffline {
            user_id: user_id.to_string(),
        }))
    }

    /// Creates the sender's delivery acknowledgment.
    pub fn create_message_sent(data: MessageRecord) -> MessageEnvelope {
        envelope(MessagePayload::MessageSent(MessageSent {
            success: true,
            data,
        }))
    }

    /// Creates the recipient's real-time delivery event.
    pub fn create_receive_message(data: MessageRecord) -> MessageEnvelope {
        envelope(MessagePayload::ReceiveMessage(ReceiveMessage { data }))
    }

    /// Creates a forwarded typing indicator.
    pub fn create_user_typing(user_id: &str, is_typing: bool) -> MessageEnvelope {
        envelope(MessagePayload::UserTyping(UserTyping {
            user_id: user_id.to_string(),
            is_typing,
        }))
    }

    /// Creates an error event.
    pub fn create_error(message: &str) -> MessageEnvelope {
        envelope(MessagePayload::Error(ErrorEvent {
            message: message.to_string(),
            error: None,
        }))
    }

    /// Creates an error event carrying the underlying failure detail.
    pub fn create_error_with_detail(message: &str, detail: &str) -> MessageEnvelope {
        envelope(MessagePayload::Error(ErrorEvent {
            message: message.to_string(),
            error: Some(detail.to_string()),
        }))
    }

    /// Decodes a message from binary data (with length prefix).
    pub fn decode_message(data: &[u8]) -> Result<MessageEnvelope, String> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err("Frame too short".to_string());
        }

        let json = &data[FRAME_HEADER_SIZE..];
        serde_json::from_slice(json).map_err(|e| e.to_string())
    }

    /// Encodes a message to binary data (with length prefix).
    pub fn encode_message(envelope: &MessageEnvelope) -> Result<Vec<u8>, String> {
        let json = serde_json::to_vec(envelope).map_err(|e| e.to_string())?;
        let len = json.len() as u32;

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + json.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&json);

        Ok(frame)
    }
}

/// Shared dependencies for handling a WebSocket connection.
pub struct ConnectionDeps {
    pub presence: Arc<PresenceDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub users: Arc<dyn UserDirectory>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: RelayMetrics,
    pub max_message_size: usize,
    pub max_text_chars: usize,
    pub idle_timeout: Duration,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Encodes and sends one envelope on this connection's WebSocket.
async fn send_event(write: &mut WsSink, session: &str, envelope: &protocol::MessageEnvelope) {
    match protocol::encode_message(envelope) {
        Ok(data) => {
            if write.send(Message::Binary(data)).await.is_err() {
                warn!("[{}] Failed to send event", session);
            }
        }
        Err(e) => error!("[{}] Failed to encode event: {}", session, e),
    }
}

/// Handles a WebSocket connection.
#[allow(clippy::too_many_lines)]
pub async fn handle_connection(ws_stream: WebSocketStream<TcpStream>, deps: ConnectionDeps) {
    let ConnectionDeps {
        presence,
        messages,
        users,
        verifier,
        rate_limiter,
        metrics,
        max_message_size,
        max_text_chars,
        idle_timeout,
    } = deps;

    let conn_id = Uuid::new_v4();
    // Short label for logs; never log tokens or message text.
    let conn_str = conn_id.to_string();
    let session = &conn_str[..8];

    let (mut write, mut read) = ws_stream.split();

    // Attach to the presence directory so broadcasts and forwards from other
    // handlers can reach this connection even before it joins.
    let mut presence_rx = presence.attach(conn_id);

    // Identity established by a successful join. Sends re-verify their own
    // token and do not depend on this.
    let mut session_user: Option<String> = None;

    debug!("[{}] Connection attached", session);

    // Process incoming events with idle timeout.
    // select! multiplexes WebSocket reads with frames queued by other
    // handlers (forwards and presence broadcasts).
    loop {
        let msg = tokio::select! {
            ws_msg = timeout(idle_timeout, read.next()) => {
                match ws_msg {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!("[{}] Disconnected", session);
                        break;
                    }
                    Err(_) => {
                        warn!("[{}] Idle timeout (slowloris protection)", session);
                        break;
                    }
                }
            }
            Some(presence_msg) = presence_rx.recv() => {
                // Pre-encoded frame from another handler.
                let _ = write.send(Message::Binary(presence_msg.data)).await;
                continue;
            }
        };

        match msg {
            Ok(Message::Binary(data)) => {
                if data.len() > max_message_size {
                    warn!("[{}] Frame too large: {} bytes", session, data.len());
                    continue;
                }

                // Rate limit by joined identity, falling back to the
                // connection itself before a join.
                let rate_key = session_user.clone().unwrap_or_else(|| conn_str.clone());
                if !rate_limiter.consume(&rate_key) {
                    metrics.rate_limited.inc();
                    warn!("[{}] Rate limited", session);
                    continue;
                }

                let envelope = match protocol::decode_message(&data) {
                    Ok(e) => e,
                    Err(e) => {
                        warn!("[{}] Failed to decode event: {}", session, e);
                        send_event(&mut write, session, &protocol::create_error("Malformed event"))
                            .await;
                        continue;
                    }
                };

                match envelope.payload {
                    protocol::MessagePayload::Join(join) => {
                        let authorized =
                            matches!(verifier.verify(&join.token), Ok(id) if id == join.user_id);
                        if !authorized {
                            metrics.auth_failures.inc();
                            warn!("[{}] Join rejected: invalid authentication", session);
                            // Connection stays open; the directory is untouched.
                            send_event(
                                &mut write,
                                session,
                                &protocol::create_error("Invalid authentication"),
                            )
                            .await;
                            continue;
                        }

                        // Re-joining under a new identity releases the old
                        // entry (guarded); no offline announcement, the user
                        // may be live on a newer connection.
                        if let Some(prev) = session_user.replace(join.user_id.clone()) {
                            if prev != join.user_id {
                                presence.remove(&prev, &conn_id);
                            }
                        }

                        presence.set(&join.user_id, conn_id);
                        metrics.joins_total.inc();
                        metrics.users_online.set(presence.online_count() as i64);
                        debug!("[{}] User joined", session);

                        send_event(&mut write, session, &protocol::create_joined(&join.user_id))
                            .await;

                        if let Ok(data) =
                            protocol::encode_message(&protocol::create_user_online(&join.user_id))
                        {
                            presence.broadcast(&PresenceMessage { data });
                        }
                    }
                    protocol::MessagePayload::SendMessage(send) => {
                        metrics.messages_received.inc();

                        // Every send re-verifies its own token.
                        let authorized =
                            matches!(verifier.verify(&send.token), Ok(id) if id == send.sender_id);
                        if !authorized {
                            metrics.auth_failures.inc();
                            warn!("[{}] Send rejected: invalid authentication", session);
                            send_event(
                                &mut write,
                                session,
                                &protocol::create_error("Invalid authentication"),
                            )
                            .await;
                            continue;
                        }

                        if send.receiver_id.is_empty() || send.text.is_empty() {
                            metrics.messages_rejected.inc();
                            send_event(
                                &mut write,
                                session,
                                &protocol::create_error("Missing required fields"),
                            )
                            .await;
                            continue;
                        }

                        if send.text.chars().count() > max_text_chars {
                            metrics.messages_rejected.inc();
                            send_event(
                                &mut write,
                                session,
                                &protocol::create_error("Message text too long"),
                            )
                            .await;
                            continue;
                        }

                        // Persist before anything is acknowledged or
                        // forwarded; no retry, no partial state on failure.
                        let stored = match messages.create(NewMessage {
                            sender_id: send.sender_id.clone(),
                            receiver_id: send.receiver_id.clone(),
                            text: send.text.clone(),
                            timestamp_ms: None,
                        }) {
                            Ok(stored) => stored,
                            Err(e) => {
                                metrics.persistence_errors.inc();
                                error!("[{}] Persistence failure: {}", session, e);
                                send_event(
                                    &mut write,
                                    session,
                                    &protocol::create_error_with_detail(
                                        "Failed to send message",
                                        &e,
                                    ),
                                )
                                .await;
                                continue;
                            }
                        };
                        metrics.messages_persisted.inc();

                        let record = protocol::MessageRecord::new(
                            &stored,
                            users.get_or_bare(&stored.sender_id),
                            users.get_or_bare(&stored.receiver_id),
                        );

                        send_event(
                            &mut write,
                            session,
                            &protocol::create_message_sent(record.clone()),
                        )
                        .await;

                        // Forward only if the recipient is online; offline is
                        // the expected silent path, the message stays stored.
                        let forwarded = match protocol::encode_message(
                            &protocol::create_receive_message(record),
                        ) {
                            Ok(data) => {
                                presence.try_send(&send.receiver_id, PresenceMessage { data })
                            }
                            Err(e) => {
                                error!("[{}] Failed to encode delivery: {}", session, e);
                                false
                            }
                        };
                        if forwarded {
                            metrics.messages_forwarded.inc();
                            debug!("[{}] Message delivered", session);
                        } else {
                            metrics.messages_offline.inc();
                            debug!("[{}] Recipient offline, message saved", session);
                        }
                    }
                    protocol::MessagePayload::Typing(typing) => {
                        // No token re-check: trusts the identity established
                        // by join. A session that never joined has no
                        // identity to forward.
                        let Some(ref user_id) = session_user else {
                            debug!("[{}] Typing from unjoined session ignored", session);
                            continue;
                        };

                        if let Ok(data) = protocol::encode_message(&protocol::create_user_typing(
                            user_id,
                            typing.is_typing,
                        )) {
                            if presence.try_send(&typing.receiver_id, PresenceMessage { data }) {
                                metrics.typing_forwarded.inc();
                            }
                        }
                    }
                    protocol::MessagePayload::Joined(_)
                    | protocol::MessagePayload::UserOnline(_)
                    | protocol::MessagePayload::MessageSent(_)
                    | protocol::MessagePayload::ReceiveMessage(_)
                    | protocol::MessagePayload::UserTyping(_)
                    | protocol::MessagePayload::UserOffline(_)
                    | protocol::MessagePayload::Error(_) => {
                        // Server-only events; clients shouldn't send these.
                        debug!("[{}] Ignoring server-only event from client", session);
                    }
                    protocol::MessagePayload::Unknown => {
                        debug!("[{}] Unknown event type", session);
                    }
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = write.send(Message::Pong(data)).await;
            }
            Ok(Message::Close(_)) => {
                debug!("[{}] Client sent close", session);
                break;
            }
            Ok(_) => {
                // Ignore text, pong, etc.
            }
            Err(e) => {
                warn!("[{}] Connection error: {}", session, e);
                break;
            }
        }
    }

    // Disconnect cleanup. The remove is guarded by this connection's id: a
    // stale session overwritten by a newer join must neither evict the newer
    // entry nor announce the user offline.
    if let Some(user_id) = session_user {
        if presence.remove(&user_id, &conn_id) {
            metrics.users_online.set(presence.online_count() as i64);
            if let Ok(data) = protocol::encode_message(&protocol::create_user_offline(&user_id)) {
                presence.broadcast(&PresenceMessage { data });
            }
            debug!("[{}] User offline", session);
        }
    }
    presence.detach(&conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_serialization_roundtrip() {
        let join = protocol::Join {
            token: "tok".to_string(),
            user_id: "alice".to_string(),
        };
        let json = serde_json::to_string(&join).unwrap();
        let parsed: protocol::Join = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.user_id, "alice");
        assert_eq!(parsed.token, "tok");
    }

    #[test]
    fn test_payload_tag_is_event_name() {
        let envelope = protocol::create_user_online("alice");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["payload"]["type"], "UserOnline");
        assert_eq!(json["payload"]["user_id"], "alice");
    }

    #[test]
    fn test_unknown_payload_decodes_to_unknown() {
        let frame = {
            let json = serde_json::json!({
                "version": 1,
                "message_id": "m1",
                "timestamp": 0,
                "payload": { "type": "SomethingNew", "field": 42 }
            });
            let bytes = serde_json::to_vec(&json).unwrap();
            let mut frame = (bytes.len() as u32).to_be_bytes().to_vec();
            frame.extend_from_slice(&bytes);
            frame
        };
        let envelope = protocol::decode_message(&frame).unwrap();
        assert!(matches!(
            envelope.payload,
            protocol::MessagePayload::Unknown
        ));
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let envelope = protocol::create_error("Invalid authentication");
        let frame = protocol::encode_message(&envelope).unwrap();
        let decoded = protocol::decode_message(&frame).unwrap();

        match decoded.payload {
            protocol::MessagePayload::Error(e) => {
                assert_eq!(e.message, "Invalid authentication");
                assert!(e.error.is_none());
            }
            other => panic!("Expected Error payload, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_short_frame() {
        assert!(protocol::decode_message(&[0, 0]).is_err());
    }

    #[test]
    fn test_error_event_carries_detail() {
        let envelope = protocol::create_error_with_detail("Failed to send message", "disk full");
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["payload"]["message"], "Failed to send message");
        assert_eq!(json["payload"]["error"], "disk full");
    }

    #[test]
    fn test_message_record_wire_shape() {
        use crate::store::StoredMessage;
        use crate::users::UserProfile;

        let stored = StoredMessage {
            id: "m1".to_string(),
            sender_id: "alice".to_string(),
            receiver_id: "bob".to_string(),
            text: "hi".to_string(),
            timestamp_ms: 42,
            is_read: false,
        };
        let record = protocol::MessageRecord::new(
            &stored,
            UserProfile {
                user_id: "alice".to_string(),
                username: Some("Alice".to_string()),
            },
            UserProfile::bare("bob"),
        );
        let envelope = protocol::create_message_sent(record);
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["payload"]["type"], "MessageSent");
        assert_eq!(json["payload"]["success"], true);
        assert_eq!(json["payload"]["data"]["id"], "m1");
        assert_eq!(json["payload"]["data"]["sender"]["username"], "Alice");
        assert_eq!(json["payload"]["data"]["receiver"]["user_id"], "bob");
        assert_eq!(json["payload"]["data"]["timestamp"], 42);
        assert_eq!(json["payload"]["data"]["is_read"], false);
    }
}
