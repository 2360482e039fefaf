//! Prometheus Metrics
//!
//! Observability metrics for monitoring the relay server.

use prometheus::{IntCounter, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Relay server metrics.
#[derive(Clone)]
pub struct RelayMetrics {
    /// Registry for all metrics.
    pub registry: Arc<Registry>,

    // Connection metrics
    /// Total WebSocket connections accepted.
    pub connections_total: IntCounter,
    /// Current active WebSocket connections.
    pub connections_active: IntGauge,
    /// Connection errors (handshake failures, capacity rejections).
    pub connection_errors: IntCounter,

    // Presence metrics
    /// Total successful joins.
    pub joins_total: IntCounter,
    /// Current users online.
    pub users_online: IntGauge,

    // Auth metrics
    /// Token verifications rejected (join and send).
    pub auth_failures: IntCounter,

    // Message metrics
    /// Total send requests received.
    pub messages_received: IntCounter,
    /// Messages durably persisted.
    pub messages_persisted: IntCounter,
    /// Persisted messages also forwarded to an online recipient.
    pub messages_forwarded: IntCounter,
    /// Persisted messages whose recipient was offline (saved, not delivered).
    pub messages_offline: IntCounter,
    /// Send requests rejected by validation.
    pub messages_rejected: IntCounter,
    /// Persistence failures.
    pub persistence_errors: IntCounter,

    // Typing metrics
    /// Typing indicators forwarded to an online recipient.
    pub typing_forwarded: IntCounter,

    // Rate limiting
    /// Events rate limited.
    pub rate_limited: IntCounter,
}

impl RelayMetrics {
    /// Creates a new metrics instance with all series registered.
    pub fn new() -> Self {
        let registry = Registry::new();

        let connections_total = IntCounter::with_opts(Opts::new(
            "relay_connections_total",
            "Total WebSocket connections accepted",
        ))
        .unwrap();

        let connections_active = IntGauge::with_opts(Opts::new(
            "relay_connections_active",
            "Current active WebSocket connections",
        ))
        .unwrap();

        let connection_errors = IntCounter::with_opts(Opts::new(
            "relay_connection_errors_total",
            "Total connection errors",
        ))
        .unwrap();

        let joins_total =
            IntCounter::with_opts(Opts::new("relay_joins_total", "Total successful joins"))
                .unwrap();

        let users_online =
            IntGauge::with_opts(Opts::new("relay_users_online", "Current users online")).unwrap();

        let auth_failures = IntCounter::with_opts(Opts::new(
            "relay_auth_failures_total",
            "Total token verifications rejected",
        ))
        .unwrap();

        let messages_received = IntCounter::with_opts(Opts::new(
            "relay_messages_received_total",
            "Total send requests received",
        ))
        .unwrap();

        let messages_persisted = IntCounter::with_opts(Opts::new(
            "relay_messages_persisted_total",
            "Total messages durably persisted",
        ))
        .unwrap();

        let messages_forwarded = IntCounter::with_opts(Opts::new(
            "relay_messages_forwarded_total",
            "Total messages forwarded to an online recipient",
        ))
        .unwrap();

        let messages_offline = IntCounter::with_opts(Opts::new(
            "relay_messages_offline_total",
            "Total messages stored for an offline recipient",
        ))
        .unwrap();

        let messages_rejected = IntCounter::with_opts(Opts::new(
            "relay_messages_rejected_total",
            "Total send requests rejected by validation",
        ))
        .unwrap();

        let persistence_errors = IntCounter::with_opts(Opts::new(
            "relay_persistence_errors_total",
            "Total persistence failures",
        ))
        .unwrap();

        let typing_forwarded = IntCounter::with_opts(Opts::new(
            "relay_typing_forwarded_total",
            "Total typing indicators forwarded",
        ))
        .unwrap();

        let rate_limited = IntCounter::with_opts(Opts::new(
            "relay_rate_limited_total",
            "Total events rate limited",
        ))
        .unwrap();

        registry
            .register(Box::new(connections_total.clone()))
            .unwrap();
        registry
            .register(Box::new(connections_active.clone()))
            .unwrap();
        registry
            .register(Box::new(connection_errors.clone()))
            .unwrap();
        registry.register(Box::new(joins_total.clone())).unwrap();
        registry.register(Box::new(users_online.clone())).unwrap();
        registry.register(Box::new(auth_failures.clone())).unwrap();
        registry
            .register(Box::new(messages_received.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_persisted.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_forwarded.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_offline.clone()))
            .unwrap();
        registry
            .register(Box::new(messages_rejected.clone()))
            .unwrap();
        registry
            .register(Box::new(persistence_errors.clone()))
            .unwrap();
        registry
            .register(Box::new(typing_forwarded.clone()))
            .unwrap();
        registry.register(Box::new(rate_limited.clone())).unwrap();

        RelayMetrics {
            registry: Arc::new(registry),
            connections_total,
            connections_active,
            connection_errors,
            joins_total,
            users_online,
            auth_failures,
            messages_received,
            messages_persisted,
            messages_forwarded,
            messages_offline,
            messages_rejected,
            persistence_errors,
            typing_forwarded,
            rate_limited,
        }
    }

    /// Encodes all metrics in Prometheus text format.
    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }
}

impl Default for RelayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_registered_series() {
        let metrics = RelayMetrics::new();
        metrics.connections_total.inc();
        metrics.messages_forwarded.inc();

        let text = metrics.encode();
        assert!(text.contains("relay_connections_total 1"));
        assert!(text.contains("relay_messages_forwarded_total 1"));
    }
}
