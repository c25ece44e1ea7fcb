//! Telnyx adapter (variant B).
//!
//! Calls go through the v2 Call Control API: JSON bodies, Bearer auth,
//! and explicit action endpoints (`streaming_start`, `hangup`) keyed by
//! the `call_control_id`. Webhook deliveries are signed with Ed25519
//! over `timestamp|body`; the public key comes from the portal and the
//! timestamp must be within a ±5 minute freshness window.

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::Engine;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::{CarrierAdapter, CarrierEvent};
use crate::error::{CallError, Result};

const API_BASE: &str = "https://api.telnyx.com/v2";

/// Maximum age (either direction) of a signed webhook.
const SIGNATURE_FRESHNESS_SECS: i64 = 300;

pub struct TelnyxAdapter {
    connection_id: String,
    api_key: String,
    /// Base64-encoded Ed25519 public key for webhook verification.
    webhook_public_key: Option<String>,
    client: reqwest::Client,
    api_base: String,
}

impl TelnyxAdapter {
    pub fn new(connection_id: String, api_key: String, webhook_public_key: Option<String>) -> Self {
        Self {
            connection_id,
            api_key,
            webhook_public_key,
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
        }
    }

    fn verifying_key(&self) -> Option<VerifyingKey> {
        let encoded = self.webhook_public_key.as_deref()?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .ok()?;
        let bytes: [u8; 32] = decoded.try_into().ok()?;
        VerifyingKey::from_bytes(&bytes).ok()
    }

    fn verify_at(&self, body: &[u8], headers: &HeaderMap, now_epoch: i64) -> bool {
        let Some(key) = self.verifying_key() else {
            return false;
        };
        let Some(signature_b64) = headers
            .get("telnyx-signature-ed25519")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Some(timestamp) = headers
            .get("telnyx-timestamp")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Ok(ts) = timestamp.parse::<i64>() else {
            return false;
        };
        if (now_epoch - ts).abs() > SIGNATURE_FRESHNESS_SECS {
            return false;
        }

        let Ok(signature_bytes) = base64::engine::general_purpose::STANDARD.decode(signature_b64)
        else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&signature_bytes) else {
            return false;
        };

        let mut message = Vec::with_capacity(timestamp.len() + 1 + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.push(b'|');
        message.extend_from_slice(body);
        key.verify(&message, &signature).is_ok()
    }
}

#[async_trait]
impl CarrierAdapter for TelnyxAdapter {
    fn name(&self) -> &'static str {
        "telnyx"
    }

    async fn place_call(&self, to: &str, from: &str, webhook_base: &str) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/calls", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "connection_id": self.connection_id,
                "to": to,
                "from": from,
                "webhook_url": format!("{webhook_base}/twiml"),
                "answering_machine_detection": "detect",
            }))
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            let message = body["errors"][0]["detail"]
                .as_str()
                .unwrap_or("call creation failed");
            return Err(CallError::provider("telnyx", status.as_u16(), message));
        }

        let handle = body["data"]["call_control_id"]
            .as_str()
            .ok_or_else(|| {
                CallError::provider("telnyx", status.as_u16(), "response missing call_control_id")
            })?
            .to_string();
        tracing::info!(call_control_id = %handle, to = to, "Telnyx call created");
        Ok(handle)
    }

    async fn start_stream(&self, handle: &str, ws_url: &str) -> Result<()> {
        let response = self
            .client
            .post(format!(
                "{}/calls/{}/actions/streaming_start",
                self.api_base, handle
            ))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "stream_url": ws_url,
                "stream_track": "inbound_track",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let message = body["errors"][0]["detail"]
                .as_str()
                .unwrap_or("streaming_start failed");
            return Err(CallError::provider("telnyx", status.as_u16(), message));
        }
        tracing::info!(call_control_id = %handle, "Telnyx media stream requested");
        Ok(())
    }

    async fn hangup(&self, handle: &str) {
        let result = self
            .client
            .post(format!("{}/calls/{}/actions/hangup", self.api_base, handle))
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({}))
            .send()
            .await;

        match result {
            Ok(r) if r.status().is_success() => {
                tracing::info!(call_control_id = %handle, "Telnyx call hung up");
            }
            Ok(r) => {
                tracing::warn!(call_control_id = %handle, status = %r.status(), "Telnyx hangup rejected");
            }
            Err(e) => {
                tracing::warn!(call_control_id = %handle, error = %e, "Telnyx hangup request failed");
            }
        }
    }

    fn streaming_xml(&self, ws_url: &str) -> String {
        // Telnyx starts streaming via the streaming_start action, but
        // TeXML-configured connections fetch the same document shape.
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Response><Connect><Stream url=\"{ws_url}\"/></Connect></Response>"
        )
    }

    fn verify_signature(&self, _url: &str, body: &[u8], headers: &HeaderMap) -> bool {
        self.verify_at(body, headers, chrono::Utc::now().timestamp())
    }

    fn parse_event(&self, body: &[u8]) -> CarrierEvent {
        let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
            return CarrierEvent::Irrelevant;
        };
        let data = &value["data"];
        let Some(handle) = data["payload"]["call_control_id"].as_str().map(String::from) else {
            return CarrierEvent::Irrelevant;
        };

        match data["event_type"].as_str() {
            Some("call.answered") => CarrierEvent::CallAnswered { handle },
            Some("call.hangup") => CarrierEvent::CallHungUp { handle },
            Some("streaming.started") => CarrierEvent::StreamingReady { handle },
            Some("call.machine.detection.ended") => CarrierEvent::AnsweringMachine {
                result: data["payload"]["result"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
                handle,
            },
            _ => CarrierEvent::Irrelevant,
        }
    }
}
