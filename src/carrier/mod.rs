//! Telephony carrier adapters.
//!
//! The session engine is carrier-agnostic: everything provider-specific
//! lives behind the [`CarrierAdapter`] trait, with one implementation
//! per supported carrier:
//!
//! - [`twilio::TwilioAdapter`] — form-urlencoded REST API, webhook
//!   signatures are HMAC-SHA1 over URL + sorted parameters.
//! - [`telnyx::TelnyxAdapter`] — JSON Call Control API, webhook
//!   signatures are Ed25519 over `timestamp|body`.
//!
//! Control events arriving on the webhook endpoint are normalized into
//! [`CarrierEvent`] at the boundary; nothing downstream ever sees raw
//! provider payloads.

pub mod telnyx;
pub mod twilio;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;

use crate::config::{Config, PhoneProvider};
use crate::error::Result;

/// Normalized carrier control event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CarrierEvent {
    /// The callee picked up.
    CallAnswered { handle: String },
    /// The call ended on the carrier side.
    CallHungUp { handle: String },
    /// The carrier reports the media stream is flowing (variant B
    /// signals this via webhook; variant A via the stream's own
    /// `start` message).
    StreamingReady { handle: String },
    /// Answering-machine detection verdict.
    AnsweringMachine { handle: String, result: String },
    /// Anything we don't act on.
    Irrelevant,
}

/// Provider-specific telephony operations.
#[async_trait]
pub trait CarrierAdapter: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &'static str;

    /// Place an outbound call. `webhook_base` is the public base URL
    /// that control webhooks should be delivered to. Returns the
    /// carrier's opaque call handle.
    async fn place_call(&self, to: &str, from: &str, webhook_base: &str) -> Result<String>;

    /// Instruct the carrier to open its media WebSocket to `ws_url`.
    /// Variant A starts the stream from the XML returned on the
    /// webhook, so its implementation is a no-op.
    async fn start_stream(&self, handle: &str, ws_url: &str) -> Result<()>;

    /// Tear the call down. Best-effort: failures are logged, never
    /// surfaced, since the call may already be gone.
    async fn hangup(&self, handle: &str);

    /// The XML document the carrier fetches to learn where to open the
    /// media WebSocket.
    fn streaming_xml(&self, ws_url: &str) -> String;

    /// Verify a webhook delivery. `url` is the full public URL the
    /// carrier posted to. Missing or malformed signatures yield
    /// `false`, never an error.
    fn verify_signature(&self, url: &str, body: &[u8], headers: &HeaderMap) -> bool;

    /// Normalize a raw webhook body into a [`CarrierEvent`].
    fn parse_event(&self, body: &[u8]) -> CarrierEvent;
}

/// Build the adapter selected by configuration.
pub fn build_adapter(config: &Config) -> Arc<dyn CarrierAdapter> {
    match config.phone_provider {
        PhoneProvider::Twilio => Arc::new(twilio::TwilioAdapter::new(
            config.phone_account_id.clone(),
            config.phone_secret.clone(),
        )),
        PhoneProvider::Telnyx => Arc::new(telnyx::TelnyxAdapter::new(
            config.phone_account_id.clone(),
            config.phone_secret.clone(),
            config.phone_webhook_public_key.clone(),
        )),
    }
}

/// Compare two byte strings without early exit, so signature checks
/// don't leak prefix length through timing.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_time_eq_works() {
        assert!(constant_time_eq(b"sig", b"sig"));
        assert!(!constant_time_eq(b"sig", b"gis"));
        assert!(!constant_time_eq(b"sig", b"signature"));
    }
}
