// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Presence Directory
//!
//! Tracks live connections and which user identity each one has joined as.
//! This is the only mutable state shared across connection handlers: every
//! accepted connection is attached with an outbound channel, and a successful
//! join maps the user id to that connection. Message and typing relays look
//! recipients up here to decide between real-time forwarding and the silent
//! offline path.
//!
//! A user maps to at most one connection. A second join for the same user
//! overwrites the entry (last writer wins); removal is guarded by the
//! caller's connection id, so a stale overwritten session disconnecting can
//! never evict the newer live session.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::mpsc;
use uuid::Uuid;

/// A pre-encoded frame queued for delivery to one connection.
#[derive(Debug, Clone)]
pub struct PresenceMessage {
    /// The encoded binary frame to send over WebSocket.
    pub data: Vec<u8>,
}

struct DirectoryInner {
    /// Every live connection, joined or not.
    connections: HashMap<Uuid, mpsc::Sender<PresenceMessage>>,
    /// Joined user identity → its one live connection.
    users: HashMap<String, Uuid>,
}

/// Thread-safe directory of live connections and joined users.
pub struct PresenceDirectory {
    inner: RwLock<DirectoryInner>,
}

impl PresenceDirectory {
    /// Creates a new empty directory.
    pub fn new() -> Self {
        PresenceDirectory {
            inner: RwLock::new(DirectoryInner {
                connections: HashMap::new(),
                users: HashMap::new(),
            }),
        }
    }

    /// Attaches a newly accepted connection. Returns the receiving end of the
    /// channel the handler drains into its WebSocket.
    pub fn attach(&self, conn_id: Uuid) -> mpsc::Receiver<PresenceMessage> {
        let (tx, rx) = mpsc::channel(64);
        let mut inner = self.inner.write().unwrap();
        inner.connections.insert(conn_id, tx);
        rx
    }

    /// Detaches a connection on disconnect. Any user entry still pointing at
    /// it must be removed separately via [`remove`](Self::remove).
    pub fn detach(&self, conn_id: &Uuid) {
        let mut inner = self.inner.write().unwrap();
        inner.connections.remove(conn_id);
    }

    /// Registers a joined user on a connection, unconditionally overwriting
    /// any previous entry for the same user. Returns the connection the
    /// entry previously pointed at, if any.
    pub fn set(&self, user_id: &str, conn_id: Uuid) -> Option<Uuid> {
        let mut inner = self.inner.write().unwrap();
        inner.users.insert(user_id.to_string(), conn_id)
    }

    /// Looks up the connection a user is currently joined on.
    pub fn get(&self, user_id: &str) -> Option<Uuid> {
        let inner = self.inner.read().unwrap();
        inner.users.get(user_id).copied()
    }

    /// Removes a user entry, but only if it still points at the caller's own
    /// connection. Returns whether an entry was actually removed.
    pub fn remove(&self, user_id: &str, conn_id: &Uuid) -> bool {
        let mut inner = self.inner.write().unwrap();
        match inner.users.get(user_id) {
            Some(current) if current == conn_id => {
                inner.users.remove(user_id);
                true
            }
            _ => false,
        }
    }

    /// Returns the user ids currently joined.
    pub fn list_online(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        inner.users.keys().cloned().collect()
    }

    /// Returns true if the user is currently joined.
    pub fn is_online(&self, user_id: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner.users.contains_key(user_id)
    }

    /// Sends a frame to a joined user. Returns true if the user is online and
    /// the frame was queued, false if the user is offline.
    pub fn try_send(&self, user_id: &str, msg: PresenceMessage) -> bool {
        let inner = self.inner.read().unwrap();
        let Some(conn_id) = inner.users.get(user_id) else {
            return false;
        };
        match inner.connections.get(conn_id) {
            Some(tx) => tx.try_send(msg).is_ok(),
            None => false,
        }
    }

    /// Queues a frame for every attached connection, joined or not.
    pub fn broadcast(&self, msg: &PresenceMessage) {
        let inner = self.inner.read().unwrap();
        for tx in inner.connections.values() {
            let _ = tx.try_send(msg.clone());
        }
    }

    /// Returns the number of attached connections.
    pub fn connection_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.connections.len()
    }

    /// Returns the number of joined users.
    pub fn online_count(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.users.len()
    }
}

impl Default for PresenceDirectory {
    fn default() -> Self {
        Self::new()
    }
}
