//! Telegram Bot API client.
//!
//! Two endpoints matter: `sendMessage` for outbound text and
//! `getUpdates` for long-polled inbound messages. Outbound messages go
//! out as Markdown first; Telegram rejects unbalanced markup with a
//! 400 whose description contains "can't parse entities", in which
//! case the message is retried once as plain text rather than lost.

use std::time::Duration;

use serde_json::{json, Value};

use crate::error::{CallError, Result};

const API_BASE: &str = "https://api.telegram.org";

/// Extra slack on the HTTP timeout over the long-poll window.
const POLL_HTTP_SLACK: Duration = Duration::from_secs(10);

/// One inbound message, reduced to what the engine needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub update_id: i64,
    pub chat_id: i64,
    pub text: String,
}

/// One `getUpdates` response. `max_update_id` covers every update in
/// the batch, including non-text ones (stickers, photos) that produce
/// no [`Update`] — the offset must advance past those too or they
/// repeat forever.
#[derive(Debug, Default)]
pub struct UpdateBatch {
    pub updates: Vec<Update>,
    pub max_update_id: Option<i64>,
}

#[derive(Clone)]
pub struct TelegramClient {
    client: reqwest::Client,
    base: String,
}

impl TelegramClient {
    pub fn new(bot_token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: format!("{API_BASE}/bot{bot_token}"),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_base(base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base: base.to_string(),
        }
    }

    /// Send a message, retrying once as plain text when Markdown is
    /// rejected.
    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        match self.send_once(chat_id, text, true).await {
            Err(CallError::Provider {
                status: 400,
                ref message,
                ..
            }) if is_entities_error(message) => {
                tracing::warn!(chat_id, "Markdown rejected, retrying as plain text");
                self.send_once(chat_id, text, false).await
            }
            other => other,
        }
    }

    async fn send_once(&self, chat_id: i64, text: &str, markdown: bool) -> Result<()> {
        let mut body = json!({ "chat_id": chat_id, "text": text });
        if markdown {
            body["parse_mode"] = Value::String("Markdown".into());
        }

        let response = self
            .client
            .post(format!("{}/sendMessage", self.base))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let value: Value = response.json().await.unwrap_or_default();
            let description = value["description"].as_str().unwrap_or("sendMessage failed");
            return Err(CallError::provider("telegram", status.as_u16(), description));
        }
        Ok(())
    }

    /// Long-poll for updates at or after `offset`. `timeout_secs = 0`
    /// is a plain short poll.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<UpdateBatch> {
        let response = self
            .client
            .post(format!("{}/getUpdates", self.base))
            .timeout(Duration::from_secs(timeout_secs) + POLL_HTTP_SLACK)
            .json(&json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message"],
            }))
            .send()
            .await?;

        let status = response.status();
        let value: Value = response.json().await.unwrap_or_default();
        if !status.is_success() || value["ok"] != true {
            let description = value["description"].as_str().unwrap_or("getUpdates failed");
            return Err(CallError::provider("telegram", status.as_u16(), description));
        }
        Ok(UpdateBatch {
            updates: parse_updates(&value),
            max_update_id: max_update_id(&value),
        })
    }
}

/// Whether a 400 description is Telegram's markup-parse complaint.
pub(crate) fn is_entities_error(description: &str) -> bool {
    description.contains("can't parse entities")
}

fn parse_updates(value: &Value) -> Vec<Update> {
    let Some(entries) = value["result"].as_array() else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| {
            let update_id = entry["update_id"].as_i64()?;
            let message = &entry["message"];
            let chat_id = message["chat"]["id"].as_i64()?;
            // Stickers, photos etc. carry no text; skip but note that
            // their update_id still advances the offset upstream.
            let text = message["text"].as_str()?.to_string();
            Some(Update {
                update_id,
                chat_id,
                text,
            })
        })
        .collect()
}

/// Highest update id in a raw getUpdates payload, text or not.
pub(crate) fn max_update_id(value: &Value) -> Option<i64> {
    value["result"]
        .as_array()?
        .iter()
        .filter_map(|e| e["update_id"].as_i64())
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn updates_payload() -> Value {
        json!({
            "ok": true,
            "result": [
                {
                    "update_id": 100,
                    "message": { "chat": { "id": 555 }, "text": "hello" }
                },
                {
                    "update_id": 101,
                    "message": { "chat": { "id": 555 }, "sticker": { "file_id": "x" } }
                },
                {
                    "update_id": 102,
                    "message": { "chat": { "id": 777 }, "text": "/help" }
                }
            ]
        })
    }

    #[test]
    fn parse_updates_extracts_text_messages() {
        let updates = parse_updates(&updates_payload());
        assert_eq!(updates.len(), 2);
        assert_eq!(
            updates[0],
            Update {
                update_id: 100,
                chat_id: 555,
                text: "hello".into()
            }
        );
        assert_eq!(updates[1].update_id, 102);
        assert_eq!(updates[1].text, "/help");
    }

    #[test]
    fn max_update_id_counts_non_text_updates() {
        assert_eq!(max_update_id(&updates_payload()), Some(102));
        assert_eq!(max_update_id(&json!({"ok": true, "result": []})), None);
    }

    #[test]
    fn parse_updates_tolerates_junk() {
        assert!(parse_updates(&json!({"ok": true})).is_empty());
        assert!(parse_updates(&json!({"ok": true, "result": [{"update_id": "nope"}]})).is_empty());
    }

    #[test]
    fn entities_error_detection() {
        assert!(is_entities_error(
            "Bad Request: can't parse entities: Can't find end of the entity"
        ));
        assert!(!is_entities_error("Bad Request: chat not found"));
    }

    #[tokio::test]
    async fn unreachable_api_is_transport_error() {
        let client = TelegramClient::with_base("http://127.0.0.1:9");
        let err = client.send_message(1, "hi").await.unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
        let err = client.get_updates(0, 0).await.unwrap_err();
        assert!(matches!(err, CallError::Transport(_)));
    }
}
