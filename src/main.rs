// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chat Relay Server
//!
//! Presence-and-delivery relay for a two-party chat service. Provides:
//! - WebSocket endpoint for join, message send and typing events
//! - Durable message storage with real-time forwarding to online recipients
//! - HTTP endpoints for health checks, presence and Prometheus metrics

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_tungstenite::accept_async;
use tracing::{error, info};

use chat_relay::auth::{self, HmacTokenVerifier, TokenVerifier};
use chat_relay::config::RelayConfig;
use chat_relay::connection_limit::ConnectionLimiter;
use chat_relay::handler::{self, ConnectionDeps};
use chat_relay::http::{create_router, HttpState};
use chat_relay::metrics::RelayMetrics;
use chat_relay::presence::PresenceDirectory;
use chat_relay::rate_limit::RateLimiter;
use chat_relay::store::{create_message_store, MessageStore};
use chat_relay::users::{create_user_directory, UserDirectory};

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chat_relay=info".parse().unwrap()),
        )
        .init();

    // Load configuration
    let config = RelayConfig::from_env();

    // TLS enforcement: bearer tokens travel on every send, so refuse to
    // start on a non-localhost address unless TLS termination is confirmed.
    let is_localhost = config.listen_addr.ip().is_loopback();
    let tls_verified = std::env::var("RELAY_TLS_VERIFIED")
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false);

    if !is_localhost && !tls_verified {
        error!("SECURITY ERROR: relay must run behind a TLS proxy in production.");
        error!(
            "Listening on {} without confirmed TLS would expose bearer tokens.",
            config.listen_addr
        );
        error!("Either run behind a TLS-terminating proxy and set RELAY_TLS_VERIFIED=true,");
        error!("or bind to localhost for development: RELAY_LISTEN_ADDR=127.0.0.1:8080");
        std::process::exit(1);
    }

    let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit_per_min));
    let connection_limiter = ConnectionLimiter::new(config.max_connections);
    let start_time = Instant::now();

    // HTTP address for presence/metrics endpoints. Localhost by default;
    // use RELAY_METRICS_ADDR to expose on other interfaces if needed.
    let http_addr =
        std::env::var("RELAY_METRICS_ADDR").unwrap_or_else(|_| "127.0.0.1:8081".to_string());

    info!("Starting Chat Relay Server v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}", config.listen_addr);
    if tls_verified {
        info!("TLS: Verified (handled by external proxy)");
    } else {
        info!("TLS: Local development mode (localhost only)");
    }
    info!("Health check (main port): {}", config.listen_addr);
    info!("Metrics endpoint: {}", http_addr);
    info!("Storage backend: {:?}", config.storage_backend);
    info!("Idle timeout: {}s", config.idle_timeout_secs);

    // Load or generate the token-signing secret shared with the account
    // service that mints tokens at login.
    let secret = auth::load_or_generate_secret(&config.data_dir);
    let verifier: Arc<dyn TokenVerifier> = Arc::new(HmacTokenVerifier::new(&secret));

    // Initialize metrics
    let metrics = RelayMetrics::new();

    // Initialize shared state
    let messages: Arc<dyn MessageStore> = Arc::from(create_message_store(
        config.storage_backend,
        Some(&config.data_dir),
    ));
    let users: Arc<dyn UserDirectory> = Arc::from(create_user_directory(
        config.storage_backend,
        Some(&config.data_dir),
    ));
    let presence = Arc::new(PresenceDirectory::new());

    // Check for metrics auth token (optional additional protection)
    let metrics_token = std::env::var("RELAY_METRICS_TOKEN").ok();
    if metrics_token.is_some() {
        info!("Metrics endpoint protected with bearer token");
    } else if !http_addr.starts_with("127.0.0.1") && !http_addr.starts_with("localhost") {
        info!("WARNING: Metrics exposed on non-localhost without auth token");
        info!("Consider setting RELAY_METRICS_TOKEN for production use");
    }

    // Start HTTP server for presence/metrics
    let http_state = HttpState {
        metrics: metrics.clone(),
        metrics_token,
        presence: presence.clone(),
    };
    let http_router = create_router(http_state);

    let http_listener = TcpListener::bind(&http_addr)
        .await
        .expect("Failed to bind HTTP listener");

    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        axum::serve(http_listener, http_router).await.unwrap();
    });

    // Start cleanup task for rate limiters (remove stale user meters)
    let cleanup_rate_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        loop {
            // Clean up every 10 minutes, removing users idle for 30 minutes
            tokio::time::sleep(std::time::Duration::from_secs(600)).await;
            let removed =
                cleanup_rate_limiter.cleanup_inactive(std::time::Duration::from_secs(1800));
            if removed > 0 {
                info!("Cleaned up {} stale rate limiter entries", removed);
            }
        }
    });

    // Start TCP listener for WebSocket
    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .expect("Failed to bind WebSocket listener");

    info!("WebSocket server listening on {}", config.listen_addr);

    let config = Arc::new(config);

    // Accept connections
    while let Ok((stream, _addr)) = listener.accept().await {
        // Enforce connection limit
        let connection_guard = match connection_limiter.try_acquire() {
            Some(guard) => guard,
            None => {
                tracing::warn!(
                    "Connection rejected: at max capacity ({}/{})",
                    connection_limiter.active_count(),
                    config.max_connections
                );
                metrics.connection_errors.inc();
                drop(stream);
                continue;
            }
        };

        let presence = presence.clone();
        let messages = messages.clone();
        let users = users.clone();
        let verifier = verifier.clone();
        let rate_limiter = rate_limiter.clone();
        let metrics = metrics.clone();
        let config = config.clone();
        let idle_timeout = config.idle_timeout();

        tokio::spawn(async move {
            // Keep the guard alive for the duration of the connection
            let _guard = connection_guard;

            // Peek at the first bytes to tell plain HTTP health probes apart
            // from WebSocket upgrades on the same port.
            let mut peek_buf = [0u8; 512];
            if let Ok(n) = stream.peek(&mut peek_buf).await {
                if n > 0 {
                    let peek_str = String::from_utf8_lossy(&peek_buf[..n]);
                    // HTTP headers are case-insensitive
                    let peek_lower = peek_str.to_ascii_lowercase();

                    let is_websocket_upgrade = peek_lower.contains("upgrade: websocket")
                        && peek_lower.contains("connection:")
                        && peek_lower.contains("upgrade");

                    if !is_websocket_upgrade && peek_lower.starts_with("get ") {
                        let is_health = peek_lower.contains("get /health")
                            || peek_lower.contains("get /up")
                            || peek_lower.contains("get /ready");

                        let body = if is_health {
                            format!(
                                r#"{{"status":"healthy","version":"{}","uptime_seconds":{},"online_users":{},"stored_messages":{}}}"#,
                                env!("CARGO_PKG_VERSION"),
                                start_time.elapsed().as_secs(),
                                presence.online_count(),
                                messages.message_count()
                            )
                        } else {
                            r#"{"error":"This is a WebSocket relay endpoint"}"#.to_string()
                        };
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        // Properly write and close the connection to prevent leaks
                        let mut stream = stream;
                        let _ = stream.write_all(response.as_bytes()).await;
                        let _ = stream.shutdown().await;
                        tracing::debug!("Handled plain HTTP request");
                        return;
                    }
                }
            }

            // Proceed with WebSocket handshake with timeout.
            // Prevents slowloris clients that connect but never complete it.
            match tokio::time::timeout(idle_timeout, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    metrics.connections_total.inc();
                    metrics.connections_active.inc();

                    info!("New WebSocket connection");
                    handler::handle_connection(
                        ws_stream,
                        ConnectionDeps {
                            presence,
                            messages,
                            users,
                            verifier,
                            rate_limiter,
                            metrics: metrics.clone(),
                            max_message_size: config.max_message_size,
                            max_text_chars: config.max_text_chars,
                            idle_timeout,
                        },
                    )
                    .await;

                    metrics.connections_active.dec();
                    info!("WebSocket connection closed");
                }
                Ok(Err(e)) => {
                    error!("WebSocket handshake failed: {}", e);
                    metrics.connection_errors.inc();
                }
                Err(_) => {
                    tracing::warn!("WebSocket handshake timeout (slowloris protection)");
                    metrics.connection_errors.inc();
                }
            }
            // _guard dropped here, releasing the connection slot
        });
    }
}
