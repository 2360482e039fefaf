//! HTTP Server for Health, Presence and Metrics Endpoints
//!
//! REST endpoints for monitoring: Prometheus metrics plus a read-only view
//! of the presence directory for the embedding services.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};

use crate::metrics::RelayMetrics;
use crate::presence::PresenceDirectory;

/// Shared state for HTTP handlers.
#[derive(Clone)]
pub struct HttpState {
    pub metrics: RelayMetrics,
    pub metrics_token: Option<String>,
    pub presence: Arc<PresenceDirectory>,
}

/// Middleware to check bearer token for the metrics endpoint.
async fn metrics_auth_middleware(
    State(state): State<HttpState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if request.uri().path() == "/metrics" {
        if let Some(ref expected_token) = state.metrics_token {
            let auth_header = request.headers().get(header::AUTHORIZATION);
            let is_authorized = auth_header.is_some_and(|h| {
                h.to_str()
                    .map(|s| {
                        s.strip_prefix("Bearer ")
                            .is_some_and(|token| token == expected_token)
                    })
                    .unwrap_or(false)
            });

            if !is_authorized {
                return (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, "Bearer")],
                    "Unauthorized",
                )
                    .into_response();
            }
        }
    }

    next.run(request).await
}

/// Creates the HTTP router.
pub fn create_router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/online", get(online_handler))
        .route("/online/{user_id}", get(online_user_handler))
        .route("/", get(root_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            metrics_auth_middleware,
        ))
        .with_state(state)
}

/// Root handler - returns basic info.
async fn root_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "chat-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/metrics", "/online", "/online/{user_id}"]
    }))
}

/// Prometheus metrics in text exposition format.
async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let metrics_text = state.metrics.encode();

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics_text,
    )
}

/// Lists the users currently online.
async fn online_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let mut users = state.presence.list_online();
    users.sort();
    Json(serde_json::json!({
        "count": users.len(),
        "users": users,
    }))
}

/// Reports whether one user is currently online.
async fn online_user_handler(
    State(state): State<HttpState>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "user_id": user_id,
        "online": state.presence.is_online(&user_id),
    }))
}
