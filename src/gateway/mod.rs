//! Axum HTTP gateway: carrier webhooks and the media WebSocket.
//!
//! Three routes, layered with body limits and request timeouts:
//!
//! - `GET /health` — liveness plus the live-session count.
//! - `POST /twiml` — carrier control webhook. Content type picks the
//!   parser (form-urlencoded = Twilio, JSON = Telnyx); the signature
//!   is verified against the raw body before anything is parsed.
//! - `GET /media-stream` — WebSocket upgrade for call audio
//!   (see [`media`]).

pub mod media;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

use crate::session::SessionEngine;

/// Maximum webhook body size (64KB) — carrier events are tiny.
pub const MAX_BODY_SIZE: usize = 65_536;

/// Webhook request timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SessionEngine>,
    pub public_base_url: String,
    /// Development escape hatch: skip webhook signature checks.
    pub allow_unsigned_webhooks: bool,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/twiml", post(handle_twiml))
        .route("/media-stream", get(media::handle_media_ws))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::new(Duration::from_secs(REQUEST_TIMEOUT_SECS)))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Gateway listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let live_sessions = state.engine.live_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "live_sessions": live_sessions,
    }))
}

/// POST /twiml — carrier control webhook.
async fn handle_twiml(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let carrier = Arc::clone(state.engine.carrier());
    let webhook_url = format!("{}/twiml", state.public_base_url);

    if !state.allow_unsigned_webhooks && !carrier.verify_signature(&webhook_url, &body, &headers) {
        let err = crate::error::CallError::Signature;
        tracing::warn!(provider = carrier.name(), "Webhook rejected: bad signature");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": err.to_string()})),
        )
            .into_response();
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let is_json = content_type.starts_with("application/json");
    if is_json && serde_json::from_slice::<serde_json::Value>(&body).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "malformed JSON body"})),
        )
            .into_response();
    }

    let event = carrier.parse_event(&body);
    tracing::debug!(provider = carrier.name(), ?event, "Webhook event");
    let xml = state.engine.handle_carrier_event(event).await;

    if is_json {
        // Variant B ignores the response body; streaming is started
        // through the adapter instead.
        Json(serde_json::json!({"status": "ok"})).into_response()
    } else {
        let body = xml.unwrap_or_else(|| {
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response/>".to_string()
        });
        ([(header::CONTENT_TYPE, "text/xml")], body).into_response()
    }
}
