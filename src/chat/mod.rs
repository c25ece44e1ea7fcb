//! Text-chat session engine (Telegram transport).
//!
//! Same tool surface as the voice engine, with a long-polling chat bot
//! standing in for the whole telephony stack. One chat is active at a
//! time.
//!
//! ## The offset race
//!
//! Telegram's `getUpdates` hands the same updates to whoever polls
//! with the lowest offset, so exactly one consumer may poll at a time.
//! While no chat is active a background task polls on a 2-second
//! cadence and answers slash commands (`/help`, `/verbose`)
//! out-of-band. The moment a chat becomes active — or the
//! `listen_for_commands` tool runs — that task is aborted, making the
//! foreground waiter the only poller; otherwise the background loop
//! would swallow the user's reply. `global_offset` only ever moves
//! forward (`max(global_offset, update_id + 1)`), so updates are never
//! replayed across the handoff.

pub mod telegram;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::dispatcher::{ToolBackend, ToolSpec};
use crate::error::{CallError, Result};
use telegram::{TelegramClient, Update};

/// Background poll cadence while no chat is active.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Long-poll window for foreground waits.
const LONG_POLL_SECS: u64 = 30;

/// Upper bound on `listen_for_commands`.
const LISTEN_FOR_COMMANDS_MAX: Duration = Duration::from_secs(24 * 60 * 60);

/// Out-of-band slash commands the engine answers itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlashCommand {
    Help,
    Verbose,
}

fn classify_command(text: &str) -> Option<SlashCommand> {
    match text.trim().split_whitespace().next() {
        Some("/help") | Some("/start") => Some(SlashCommand::Help),
        Some("/verbose") => Some(SlashCommand::Verbose),
        _ => None,
    }
}

const HELP_TEXT: &str = "I'm the assistant's phone line. It will message you here when it \
                         needs you; just reply in plain text.\n\n\
                         /verbose — toggle verbose replies\n\
                         /help — this message";

struct ActiveChat {
    session_id: u64,
    chat_id: i64,
    started: Instant,
}

pub struct ChatEngine {
    client: TelegramClient,
    /// Next getUpdates offset; never regresses.
    global_offset: AtomicI64,
    /// Last chat that talked to the bot (0 = nobody yet).
    known_chat: AtomicI64,
    verbose: AtomicBool,
    next_id: AtomicU64,
    reply_timeout: Duration,
    active: parking_lot::Mutex<Option<ActiveChat>>,
    poller: AsyncMutex<Option<JoinHandle<()>>>,
}

impl ChatEngine {
    pub fn new(bot_token: &str, reply_timeout: Duration) -> Self {
        Self::with_client(TelegramClient::new(bot_token), reply_timeout)
    }

    fn with_client(client: TelegramClient, reply_timeout: Duration) -> Self {
        Self {
            client,
            global_offset: AtomicI64::new(0),
            known_chat: AtomicI64::new(0),
            verbose: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            reply_timeout,
            active: parking_lot::Mutex::new(None),
            poller: AsyncMutex::new(None),
        }
    }

    /// Advance the poll offset; the max keeps it monotonic no matter
    /// which consumer saw the update.
    fn advance_offset(&self, update_id: i64) {
        self.global_offset.fetch_max(update_id + 1, Ordering::SeqCst);
    }

    fn offset(&self) -> i64 {
        self.global_offset.load(Ordering::SeqCst)
    }

    fn note_sender(&self, chat_id: i64) {
        self.known_chat.store(chat_id, Ordering::SeqCst);
    }

    /// Answer a slash command. Returns true when the update was
    /// consumed out-of-band.
    async fn handle_out_of_band(&self, update: &Update) -> bool {
        match classify_command(&update.text) {
            Some(SlashCommand::Help) => {
                let _ = self.client.send_message(update.chat_id, HELP_TEXT).await;
                true
            }
            Some(SlashCommand::Verbose) => {
                let now = !self.verbose.load(Ordering::SeqCst);
                self.verbose.store(now, Ordering::SeqCst);
                let ack = if now { "Verbose replies on." } else { "Verbose replies off." };
                let _ = self.client.send_message(update.chat_id, ack).await;
                true
            }
            None => false,
        }
    }

    // ── Background polling ───────────────────────────────────────

    /// Start the idle poller. Cancels any previous one first.
    pub async fn start_background_poll(self: &Arc<Self>) {
        self.stop_background_poll().await;
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                match engine.client.get_updates(engine.offset(), 0).await {
                    Ok(batch) => {
                        if let Some(max_id) = batch.max_update_id {
                            engine.advance_offset(max_id);
                        }
                        for update in &batch.updates {
                            engine.note_sender(update.chat_id);
                            if !engine.handle_out_of_band(update).await {
                                tracing::debug!(
                                    chat_id = update.chat_id,
                                    "Idle message with no active chat, ignored"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Background poll failed");
                    }
                }
            }
        });
        *self.poller.lock().await = Some(handle);
    }

    /// Abort the idle poller so a foreground wait is the only
    /// getUpdates consumer.
    pub async fn stop_background_poll(&self) {
        if let Some(handle) = self.poller.lock().await.take() {
            handle.abort();
        }
    }

    // ── Foreground waits ─────────────────────────────────────────

    /// Long-poll for the active chat's next plain message.
    async fn wait_for_reply(&self, chat_id: i64, timeout: Duration) -> Result<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .ok_or(CallError::TranscriptTimeout(timeout.as_secs()))?;
            let window = remaining.as_secs().clamp(1, LONG_POLL_SECS);

            let batch = match self.client.get_updates(self.offset(), window).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "Reply poll failed, retrying");
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                    continue;
                }
            };
            if let Some(max_id) = batch.max_update_id {
                self.advance_offset(max_id);
            }
            for update in &batch.updates {
                self.note_sender(update.chat_id);
                if self.handle_out_of_band(update).await {
                    continue;
                }
                if update.chat_id == chat_id {
                    return Ok(update.text.clone());
                }
                tracing::debug!(
                    chat_id = update.chat_id,
                    "Message from another chat during an active session, ignored"
                );
            }
        }
    }

    fn active_chat(&self, session_id: u64) -> Result<i64> {
        match self.active.lock().as_ref() {
            Some(active) if active.session_id == session_id => Ok(active.chat_id),
            _ => Err(CallError::NoSuchSession(session_id)),
        }
    }

    // ── Session operations (the tool surface) ────────────────────

    /// Open a chat: send the opening message and wait for the reply.
    pub async fn initiate(self: &Arc<Self>, text: &str) -> Result<(u64, String)> {
        let chat_id = self.known_chat.load(Ordering::SeqCst);
        if chat_id == 0 {
            return Err(CallError::provider(
                "telegram",
                0,
                "nobody has messaged the bot yet; ask the user to /start it",
            ));
        }
        if self.active.lock().is_some() {
            return Err(CallError::provider(
                "telegram",
                0,
                "a chat session is already active",
            ));
        }

        self.stop_background_poll().await;
        let session_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        *self.active.lock() = Some(ActiveChat {
            session_id,
            chat_id,
            started: Instant::now(),
        });
        tracing::info!(session_id, chat_id, "Chat session opened");

        let result = async {
            self.client.send_message(chat_id, text).await?;
            self.wait_for_reply(chat_id, self.reply_timeout).await
        }
        .await;

        match result {
            Ok(reply) => Ok((session_id, reply)),
            Err(e @ CallError::TranscriptTimeout(_)) => Err(e),
            Err(e) => {
                // Failed to open: release the slot and resume idling.
                *self.active.lock() = None;
                self.start_background_poll().await;
                Err(e)
            }
        }
    }

    pub async fn continue_chat(&self, session_id: u64, text: &str) -> Result<String> {
        let chat_id = self.active_chat(session_id)?;
        self.client.send_message(chat_id, text).await?;
        self.wait_for_reply(chat_id, self.reply_timeout).await
    }

    pub async fn say(&self, session_id: u64, text: &str) -> Result<()> {
        let chat_id = self.active_chat(session_id)?;
        self.client.send_message(chat_id, text).await
    }

    /// Close the active chat and resume background polling. Returns
    /// the session duration in seconds.
    pub async fn end(self: &Arc<Self>, session_id: u64, text: Option<&str>) -> Result<u64> {
        let chat_id = self.active_chat(session_id)?;
        if let Some(text) = text {
            if let Err(e) = self.client.send_message(chat_id, text).await {
                tracing::warn!(session_id, error = %e, "Farewell message failed");
            }
        }
        let duration = {
            let mut active = self.active.lock();
            let started = active.as_ref().map(|a| a.started);
            *active = None;
            started.map(|s| s.elapsed().as_secs()).unwrap_or(0)
        };
        self.start_background_poll().await;
        tracing::info!(session_id, duration_secs = duration, "Chat session closed");
        Ok(duration)
    }

    /// Block until the user sends something, with no chat active.
    /// Bounded at 24 hours.
    pub async fn listen_for_commands(self: &Arc<Self>, timeout: Duration) -> Result<String> {
        let timeout = timeout.min(LISTEN_FOR_COMMANDS_MAX);
        self.stop_background_poll().await;

        let deadline = tokio::time::Instant::now() + timeout;
        let result = loop {
            let Some(remaining) = deadline.checked_duration_since(tokio::time::Instant::now())
            else {
                break Err(CallError::TranscriptTimeout(timeout.as_secs()));
            };
            let window = remaining.as_secs().clamp(1, LONG_POLL_SECS);

            let batch = match self.client.get_updates(self.offset(), window).await {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(error = %e, "Command poll failed, retrying");
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                    continue;
                }
            };
            if let Some(max_id) = batch.max_update_id {
                self.advance_offset(max_id);
            }
            let mut found = None;
            for update in &batch.updates {
                self.note_sender(update.chat_id);
                if self.handle_out_of_band(update).await {
                    continue;
                }
                found = Some(update.text.clone());
                break;
            }
            if let Some(text) = found {
                break Ok(text);
            }
        };

        if self.active.lock().is_none() {
            self.start_background_poll().await;
        }
        result
    }
}

// ── Tool surface ─────────────────────────────────────────────────

#[async_trait]
impl ToolBackend for Arc<ChatEngine> {
    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "initiate_call",
                description: "Open a chat with the user, send the opening message, and return \
                              their reply.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "message": { "type": "string" }
                    },
                    "required": ["message"]
                }),
            },
            ToolSpec {
                name: "continue_call",
                description: "Send a message on the active chat and return the user's reply.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "integer" },
                        "message": { "type": "string" }
                    },
                    "required": ["session_id", "message"]
                }),
            },
            ToolSpec {
                name: "speak_to_user",
                description: "Send a message on the active chat without waiting for a reply.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "integer" },
                        "message": { "type": "string" }
                    },
                    "required": ["session_id", "message"]
                }),
            },
            ToolSpec {
                name: "end_call",
                description: "Send an optional goodbye and close the chat session.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "integer" },
                        "message": { "type": "string" }
                    },
                    "required": ["session_id"]
                }),
            },
            ToolSpec {
                name: "listen_for_commands",
                description: "Wait (up to 24h) for the user to send a message while no chat is \
                              active.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "timeout_secs": { "type": "integer" }
                    }
                }),
            },
        ]
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value> {
        match name {
            "initiate_call" => {
                let message = arguments["message"]
                    .as_str()
                    .ok_or_else(|| CallError::Protocol("missing argument: message".into()))?;
                let (session_id, reply) = self.initiate(message).await?;
                Ok(json!({ "session_id": session_id, "transcript": reply }))
            }
            "continue_call" => {
                let id = arguments["session_id"]
                    .as_u64()
                    .ok_or_else(|| CallError::Protocol("missing argument: session_id".into()))?;
                let message = arguments["message"]
                    .as_str()
                    .ok_or_else(|| CallError::Protocol("missing argument: message".into()))?;
                let reply = self.continue_chat(id, message).await?;
                Ok(json!({ "transcript": reply }))
            }
            "speak_to_user" => {
                let id = arguments["session_id"]
                    .as_u64()
                    .ok_or_else(|| CallError::Protocol("missing argument: session_id".into()))?;
                let message = arguments["message"]
                    .as_str()
                    .ok_or_else(|| CallError::Protocol("missing argument: message".into()))?;
                self.say(id, message).await?;
                Ok(json!({ "status": "ok" }))
            }
            "end_call" => {
                let id = arguments["session_id"]
                    .as_u64()
                    .ok_or_else(|| CallError::Protocol("missing argument: session_id".into()))?;
                let message = arguments["message"].as_str().filter(|s| !s.is_empty());
                let duration_secs = self.end(id, message).await?;
                Ok(json!({ "duration_secs": duration_secs }))
            }
            "listen_for_commands" => {
                let timeout = arguments["timeout_secs"]
                    .as_u64()
                    .map(Duration::from_secs)
                    .unwrap_or(LISTEN_FOR_COMMANDS_MAX);
                let text = self.listen_for_commands(timeout).await?;
                Ok(json!({ "message": text }))
            }
            other => Err(CallError::Protocol(format!("unknown tool: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Arc<ChatEngine> {
        // Unroutable API base: every HTTP call fails fast, which is
        // exactly what these tests want.
        Arc::new(ChatEngine::with_client(
            TelegramClient::with_base("http://127.0.0.1:9"),
            Duration::from_secs(5),
        ))
    }

    #[test]
    fn offset_never_regresses() {
        let e = engine();
        e.advance_offset(5);
        assert_eq!(e.offset(), 6);
        e.advance_offset(3);
        assert_eq!(e.offset(), 6);
        e.advance_offset(10);
        assert_eq!(e.offset(), 11);
    }

    #[test]
    fn command_classification() {
        assert_eq!(classify_command("/help"), Some(SlashCommand::Help));
        assert_eq!(classify_command("/start"), Some(SlashCommand::Help));
        assert_eq!(classify_command("/verbose"), Some(SlashCommand::Verbose));
        assert_eq!(classify_command("  /verbose now  "), Some(SlashCommand::Verbose));
        assert_eq!(classify_command("hello"), None);
        assert_eq!(classify_command("/unknown"), None);
        assert_eq!(classify_command(""), None);
    }

    #[tokio::test]
    async fn initiate_without_known_chat_fails() {
        let e = engine();
        let err = e.initiate("hello").await.unwrap_err();
        assert!(matches!(err, CallError::Provider { .. }));
        assert!(e.active.lock().is_none());
    }

    #[tokio::test]
    async fn operations_need_a_matching_session() {
        let e = engine();
        assert!(matches!(
            e.continue_chat(7, "hi").await.unwrap_err(),
            CallError::NoSuchSession(7)
        ));
        assert!(matches!(
            e.say(7, "hi").await.unwrap_err(),
            CallError::NoSuchSession(7)
        ));
        assert!(matches!(
            e.end(7, None).await.unwrap_err(),
            CallError::NoSuchSession(7)
        ));
    }

    #[tokio::test]
    async fn background_poll_stop_is_idempotent() {
        let e = engine();
        e.start_background_poll().await;
        assert!(e.poller.lock().await.is_some());
        e.stop_background_poll().await;
        assert!(e.poller.lock().await.is_none());
        e.stop_background_poll().await;
    }

    #[tokio::test]
    async fn restarting_poll_replaces_the_task() {
        let e = engine();
        e.start_background_poll().await;
        e.start_background_poll().await;
        assert!(e.poller.lock().await.is_some());
        e.stop_background_poll().await;
    }

    #[tokio::test]
    async fn chat_tools_include_listen_for_commands() {
        let e = engine();
        let names: Vec<&str> = e.tools().iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            [
                "initiate_call",
                "continue_call",
                "speak_to_user",
                "end_call",
                "listen_for_commands"
            ]
        );
    }

    #[tokio::test]
    async fn verbose_toggle_flips_state() {
        let e = engine();
        assert!(!e.verbose.load(Ordering::SeqCst));
        // The ack send fails (unroutable base) but the toggle sticks.
        let update = Update {
            update_id: 1,
            chat_id: 5,
            text: "/verbose".into(),
        };
        assert!(e.handle_out_of_band(&update).await);
        assert!(e.verbose.load(Ordering::SeqCst));
        assert!(e.handle_out_of_band(&update).await);
        assert!(!e.verbose.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn plain_message_is_not_out_of_band() {
        let e = engine();
        let update = Update {
            update_id: 1,
            chat_id: 5,
            text: "yes, go ahead".into(),
        };
        assert!(!e.handle_out_of_band(&update).await);
    }
}
