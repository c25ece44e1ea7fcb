//! Twilio adapter (variant A).
//!
//! Calls are placed through the 2010-04-01 REST API with HTTP Basic
//! auth and form-urlencoded bodies. Twilio fetches the streaming XML
//! from our `/twiml` webhook when the callee answers, and every webhook
//! delivery is signed with HMAC-SHA1 over the request URL concatenated
//! with the form parameters sorted by key.

use async_trait::async_trait;
use axum::http::HeaderMap;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use super::{constant_time_eq, CarrierAdapter, CarrierEvent};
use crate::error::{CallError, Result};

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

pub struct TwilioAdapter {
    account_sid: String,
    auth_token: String,
    client: reqwest::Client,
    api_base: String,
}

impl TwilioAdapter {
    pub fn new(account_sid: String, auth_token: String) -> Self {
        Self {
            account_sid,
            auth_token,
            client: reqwest::Client::new(),
            api_base: API_BASE.to_string(),
        }
    }

    #[cfg(test)]
    fn with_api_base(mut self, base: &str) -> Self {
        self.api_base = base.to_string();
        self
    }

    /// Decoded form parameters from a webhook body.
    fn form_pairs(body: &[u8]) -> Vec<(String, String)> {
        url::form_urlencoded::parse(body).into_owned().collect()
    }

    /// The string Twilio signs: URL followed by `key1value1key2value2…`
    /// with parameters sorted by key.
    fn signature_payload(url: &str, body: &[u8]) -> String {
        let mut pairs = Self::form_pairs(body);
        pairs.sort();
        let mut data = url.to_string();
        for (key, value) in pairs {
            data.push_str(&key);
            data.push_str(&value);
        }
        data
    }

    fn compute_signature(&self, url: &str, body: &[u8]) -> Option<String> {
        let mut mac = Hmac::<Sha1>::new_from_slice(self.auth_token.as_bytes()).ok()?;
        mac.update(Self::signature_payload(url, body).as_bytes());
        Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
    }
}

#[async_trait]
impl CarrierAdapter for TwilioAdapter {
    fn name(&self) -> &'static str {
        "twilio"
    }

    async fn place_call(&self, to: &str, from: &str, webhook_base: &str) -> Result<String> {
        let webhook_url = format!("{webhook_base}/twiml");
        let response = self
            .client
            .post(format!(
                "{}/Accounts/{}/Calls.json",
                self.api_base, self.account_sid
            ))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", to),
                ("From", from),
                ("Url", webhook_url.as_str()),
                ("Method", "POST"),
                ("StatusCallback", webhook_url.as_str()),
                ("MachineDetection", "Enable"),
            ])
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        if !status.is_success() {
            let message = body["message"].as_str().unwrap_or("call creation failed");
            return Err(CallError::provider("twilio", status.as_u16(), message));
        }

        let sid = body["sid"]
            .as_str()
            .ok_or_else(|| CallError::provider("twilio", status.as_u16(), "response missing sid"))?
            .to_string();
        tracing::info!(call_sid = %sid, to = to, "Twilio call created");
        Ok(sid)
    }

    async fn start_stream(&self, _handle: &str, _ws_url: &str) -> Result<()> {
        // Twilio starts the stream from the <Connect><Stream> verb in
        // the TwiML answer; there is no separate API call.
        Ok(())
    }

    async fn hangup(&self, handle: &str) {
        let result = self
            .client
            .post(format!(
                "{}/Accounts/{}/Calls/{}.json",
                self.api_base, self.account_sid, handle
            ))
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await;

        match result {
            Ok(r) if r.status().is_success() => {
                tracing::info!(call_sid = %handle, "Twilio call hung up");
            }
            Ok(r) => {
                tracing::warn!(call_sid = %handle, status = %r.status(), "Twilio hangup rejected");
            }
            Err(e) => {
                tracing::warn!(call_sid = %handle, error = %e, "Twilio hangup request failed");
            }
        }
    }

    fn streaming_xml(&self, ws_url: &str) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Response><Connect><Stream url=\"{ws_url}\"/></Connect></Response>"
        )
    }

    fn verify_signature(&self, url: &str, body: &[u8], headers: &HeaderMap) -> bool {
        let Some(signature) = headers
            .get("x-twilio-signature")
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let Some(computed) = self.compute_signature(url, body) else {
            return false;
        };
        constant_time_eq(computed.as_bytes(), signature.as_bytes())
    }

    fn parse_event(&self, body: &[u8]) -> CarrierEvent {
        let pairs = Self::form_pairs(body);
        let field = |name: &str| -> Option<&str> {
            pairs
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.as_str())
        };

        let Some(handle) = field("CallSid").map(str::to_string) else {
            return CarrierEvent::Irrelevant;
        };

        if let Some(answered_by) = field("AnsweredBy") {
            if answered_by != "human" && answered_by != "unknown" {
                return CarrierEvent::AnsweringMachine {
                    handle,
                    result: answered_by.to_string(),
                };
            }
        }

        match field("CallStatus") {
            Some("in-progress") | Some("answered") => CarrierEvent::CallAnswered { handle },
            Some("completed") | Some("busy") | Some("failed") | Some("no-answer")
            | Some("canceled") => CarrierEvent::CallHungUp { handle },
            _ => CarrierEvent::Irrelevant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> TwilioAdapter {
        TwilioAdapter::new("AC123".into(), "secret-token".into())
    }

    fn signed_headers(adapter: &TwilioAdapter, url: &str, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        let sig = adapter.compute_signature(url, body).unwrap();
        headers.insert("x-twilio-signature", sig.parse().unwrap());
        headers
    }

    #[test]
    fn signature_payload_sorts_params() {
        let body = b"Zebra=last&Apple=first";
        let payload = TwilioAdapter::signature_payload("https://x.example/twiml", body);
        assert_eq!(payload, "https://x.example/twimlApplefirstZebralast");
    }

    #[test]
    fn signature_payload_decodes_values() {
        let body = b"CallStatus=in-progress&To=%2B15550002222";
        let payload = TwilioAdapter::signature_payload("https://x.example/twiml", body);
        assert!(payload.contains("To+15550002222"));
    }

    #[test]
    fn valid_signature_accepted() {
        let a = adapter();
        let url = "https://x.example/twiml";
        let body = b"CallSid=CA1&CallStatus=in-progress";
        let headers = signed_headers(&a, url, body);
        assert!(a.verify_signature(url, body, &headers));
    }

    #[test]
    fn missing_signature_rejected() {
        let a = adapter();
        assert!(!a.verify_signature("https://x.example/twiml", b"CallSid=CA1", &HeaderMap::new()));
    }

    #[test]
    fn tampered_body_rejected() {
        let a = adapter();
        let url = "https://x.example/twiml";
        let headers = signed_headers(&a, url, b"CallSid=CA1&CallStatus=in-progress");
        assert!(!a.verify_signature(url, b"CallSid=CA1&CallStatus=completed", &headers));
    }

    #[test]
    fn wrong_key_rejected() {
        let a = adapter();
        let other = TwilioAdapter::new("AC123".into(), "different-token".into());
        let url = "https://x.example/twiml";
        let body = b"CallSid=CA1";
        let headers = signed_headers(&other, url, body);
        assert!(!a.verify_signature(url, body, &headers));
    }

    #[test]
    fn parse_answered_event() {
        let event = adapter().parse_event(b"CallSid=CA9&CallStatus=in-progress");
        assert_eq!(
            event,
            CarrierEvent::CallAnswered {
                handle: "CA9".into()
            }
        );
    }

    #[test]
    fn parse_hangup_events() {
        for status in ["completed", "busy", "failed", "no-answer", "canceled"] {
            let body = format!("CallSid=CA9&CallStatus={status}");
            assert_eq!(
                adapter().parse_event(body.as_bytes()),
                CarrierEvent::CallHungUp {
                    handle: "CA9".into()
                },
                "status {status}"
            );
        }
    }

    #[test]
    fn parse_machine_detection() {
        let event = adapter().parse_event(b"CallSid=CA9&CallStatus=in-progress&AnsweredBy=machine_start");
        assert_eq!(
            event,
            CarrierEvent::AnsweringMachine {
                handle: "CA9".into(),
                result: "machine_start".into()
            }
        );
    }

    #[test]
    fn human_answer_is_not_machine() {
        let event = adapter().parse_event(b"CallSid=CA9&CallStatus=in-progress&AnsweredBy=human");
        assert_eq!(
            event,
            CarrierEvent::CallAnswered {
                handle: "CA9".into()
            }
        );
    }

    #[test]
    fn parse_unknown_event_is_irrelevant() {
        assert_eq!(
            adapter().parse_event(b"CallSid=CA9&CallStatus=queued"),
            CarrierEvent::Irrelevant
        );
        assert_eq!(adapter().parse_event(b"Digits=5"), CarrierEvent::Irrelevant);
        assert_eq!(adapter().parse_event(b"not&&valid%ZZ"), CarrierEvent::Irrelevant);
    }

    #[test]
    fn streaming_xml_embeds_url() {
        let xml = adapter().streaming_xml("wss://x.example/media-stream?token=abc");
        assert!(xml.contains("<Connect><Stream url=\"wss://x.example/media-stream?token=abc\"/>"));
        assert!(xml.starts_with("<?xml"));
    }

    #[tokio::test]
    async fn start_stream_is_a_noop() {
        adapter().start_stream("CA1", "wss://x").await.unwrap();
    }

    #[tokio::test]
    async fn place_call_surfaces_provider_error() {
        // Unroutable local endpoint: the request itself fails, which
        // must surface as a transport error rather than a panic.
        let a = adapter().with_api_base("http://127.0.0.1:9");
        let err = a
            .place_call("+15550002222", "+15550001111", "https://x.example")
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
    }
}
