//! Relay Server Configuration
//!
//! Configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::store::StorageBackend;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to listen on.
    pub listen_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Maximum wire frame size in bytes.
    pub max_message_size: usize,
    /// Maximum chat message text length in characters.
    pub max_text_chars: usize,
    /// Rate limit (events per minute per user).
    pub rate_limit_per_min: u32,
    /// Storage backend (memory or sqlite).
    pub storage_backend: StorageBackend,
    /// Data directory for persistent storage and the token secret.
    pub data_dir: PathBuf,
    /// Idle timeout in seconds (slowloris protection; also bounds how long an
    /// unauthenticated connection can sit silent).
    pub idle_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_addr: "0.0.0.0:8080".parse().unwrap(),
            max_connections: 1000,
            max_message_size: 65_536, // 64 KiB per frame
            max_text_chars: 5000,
            rate_limit_per_min: 120,
            storage_backend: StorageBackend::Sqlite, // Persistent by default
            data_dir: PathBuf::from("./data"),
            idle_timeout_secs: 300, // 5 minutes
        }
    }
}

impl RelayConfig {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("RELAY_LISTEN_ADDR") {
            if let Ok(parsed) = addr.parse() {
                config.listen_addr = parsed;
            }
        }

        if let Ok(val) = std::env::var("RELAY_MAX_CONNECTIONS") {
            if let Ok(parsed) = val.parse() {
                config.max_connections = parsed;
            }
        }

        if let Ok(val) = std::env::var("RELAY_MAX_MESSAGE_SIZE") {
            if let Ok(parsed) = val.parse() {
                config.max_message_size = parsed;
            }
        }

        if let Ok(val) = std::env::var("RELAY_MAX_TEXT_CHARS") {
            if let Ok(parsed) = val.parse() {
                config.max_text_chars = parsed;
            }
        }

        if let Ok(val) = std::env::var("RELAY_RATE_LIMIT") {
            if let Ok(parsed) = val.parse() {
                config.rate_limit_per_min = parsed;
            }
        }

        if let Ok(val) = std::env::var("RELAY_STORAGE_BACKEND") {
            config.storage_backend = match val.to_lowercase().as_str() {
                "memory" => StorageBackend::Memory,
                _ => StorageBackend::Sqlite,
            };
        }

        if let Ok(val) = std::env::var("RELAY_DATA_DIR") {
            config.data_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("RELAY_IDLE_TIMEOUT") {
            if let Ok(parsed) = val.parse() {
                config.idle_timeout_secs = parsed;
            }
        }

        config
    }

    /// Returns the idle timeout as a Duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}
