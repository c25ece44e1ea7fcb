//! The per-call state machine.
//!
//! One engine owns every live session and coordinates the carrier
//! adapter, the recognizer, synthesis, and the media stream:
//!
//! ```text
//!    placing ──carrier OK──► ringing ──(ready ∧ ws open)──► streaming
//!       │                        │                             │
//!       │ carrier error          │ 15 s timeout                ▼
//!       ▼                        ▼                          talking ⇄ speak + listen
//!    cleanup                  cleanup                          │
//!                                                     hangup / end_call
//!                                                              ▼
//!                                                           cleanup
//! ```
//!
//! Cleanup runs on every path that terminates a call, and is
//! idempotent: whichever of the dispatcher, the webhook handler, or a
//! failed operation gets there first wins, the rest are no-ops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::Message as WsMessage;
use base64::Engine as _;
use futures_util::SinkExt;
use rand::RngCore;
use tokio::sync::Mutex as AsyncMutex;

use super::pacer::{self, FrameSink};
use super::{Session, SessionTable, Speaker};
use crate::audio;
use crate::carrier::{CarrierAdapter, CarrierEvent};
use crate::error::{CallError, Result};
use crate::stt::{SttConfig, SttSession};
use crate::tts::TtsClient;

/// How long the media stream gets to come up after the call is placed.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Poll cadence for both the connection wait and the hangup watcher.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pause after the last frame of an utterance so it finishes playing.
const POST_AUDIO_DRAIN: Duration = Duration::from_millis(200);

/// Pause before hanging up so the farewell is heard.
const HANGUP_DRAIN: Duration = Duration::from_secs(2);

/// Engine-level settings resolved from configuration.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub to_number: String,
    pub from_number: String,
    pub public_base_url: String,
    /// `wss://…/media-stream` — token is appended per session.
    pub media_stream_base: String,
    pub transcript_timeout: Duration,
    /// Whether outbound frames must carry the stream sub-identifier.
    pub require_stream_sid: bool,
}

pub struct SessionEngine {
    table: AsyncMutex<SessionTable>,
    next_id: AtomicU64,
    carrier: Arc<dyn CarrierAdapter>,
    tts: TtsClient,
    stt_config: SttConfig,
    settings: EngineSettings,
}

impl SessionEngine {
    pub fn new(
        carrier: Arc<dyn CarrierAdapter>,
        tts: TtsClient,
        stt_config: SttConfig,
        settings: EngineSettings,
    ) -> Self {
        Self {
            table: AsyncMutex::new(SessionTable::default()),
            next_id: AtomicU64::new(1),
            carrier,
            tts,
            stt_config,
            settings,
        }
    }

    pub fn carrier(&self) -> &Arc<dyn CarrierAdapter> {
        &self.carrier
    }

    pub async fn live_count(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn session_by_token(&self, token: &str) -> Option<Arc<Session>> {
        self.table.lock().await.by_token(token)
    }

    async fn by_handle(&self, handle: &str) -> Option<Arc<Session>> {
        self.table.lock().await.by_handle(handle)
    }

    async fn get(&self, id: u64) -> Result<Arc<Session>> {
        self.table
            .lock()
            .await
            .get(id)
            .ok_or(CallError::NoSuchSession(id))
    }

    fn media_ws_url(&self, session: &Session) -> String {
        format!("{}?token={}", self.settings.media_stream_base, session.token)
    }

    // ── Call lifecycle ───────────────────────────────────────────

    /// Place a call and speak the opening line, then listen for the
    /// first reply. Returns the session id and the transcript.
    pub async fn initiate(&self, text: &str) -> Result<(u64, String)> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Session::new(
            id,
            generate_token(),
            self.settings.to_number.clone(),
            self.settings.from_number.clone(),
            self.settings.require_stream_sid,
        ));
        self.table.lock().await.insert(Arc::clone(&session));
        tracing::info!(session_id = id, to = %session.to, "Initiating call");

        match self.run_initiate(&session, text).await {
            Ok(transcript) => {
                session.push_history(Speaker::Assistant, text);
                session.push_history(Speaker::User, &transcript);
                Ok((id, transcript))
            }
            // A silent caller ends the turn, not the call.
            Err(e @ CallError::TranscriptTimeout(_)) => Err(e),
            Err(e) => {
                self.cleanup(id).await;
                Err(e)
            }
        }
    }

    async fn run_initiate(&self, session: &Arc<Session>, text: &str) -> Result<String> {
        let stt = Arc::new(SttSession::connect(session.id, &self.stt_config).await?);
        session.set_stt(stt);

        // Pre-generate the opening line while the carrier dials: the
        // synthesis round-trip rides inside the call-setup latency, so
        // speech starts the moment the stream is up.
        let tts = self.tts.clone();
        let opening = text.to_string();
        let pregen = tokio::spawn(async move {
            let pcm = tts.synthesize(&opening).await?;
            Ok::<_, CallError>(audio::pcm_to_mulaw(&audio::downsample_24k_to_8k(&pcm)))
        });

        let placed = self
            .carrier
            .place_call(&session.to, &session.from, &self.settings.public_base_url)
            .await;
        let handle = match placed {
            Ok(h) => h,
            Err(e) => {
                pregen.abort();
                return Err(e);
            }
        };
        session.set_call_handle(handle.clone());
        self.table.lock().await.index_handle(session.id, &handle);

        if let Err(e) = self.wait_for_stream(session).await {
            pregen.abort();
            return Err(e);
        }

        let mulaw = pregen
            .await
            .map_err(|e| CallError::Transport(format!("pre-generation task failed: {e}")))??;

        let sink = SessionSink { session };
        pacer::pace_buffered(&mulaw, &sink).await?;
        tokio::time::sleep(POST_AUDIO_DRAIN).await;

        listen(session, self.settings.transcript_timeout).await
    }

    /// Speak a turn and listen for the reply.
    pub async fn continue_call(&self, id: u64, text: &str) -> Result<String> {
        let session = self.get(id).await?;
        if session.is_hung_up() {
            self.cleanup(id).await;
            return Err(CallError::CallHungUp);
        }

        let result = self.speak_streaming(&session, text).await;
        let result = match result {
            Ok(()) => listen(&session, self.settings.transcript_timeout).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(transcript) => {
                session.push_history(Speaker::Assistant, text);
                session.push_history(Speaker::User, &transcript);
                Ok(transcript)
            }
            Err(CallError::CallHungUp) => {
                self.cleanup(id).await;
                Err(CallError::CallHungUp)
            }
            // Timeouts and provider hiccups leave the call live.
            Err(e) => Err(e),
        }
    }

    /// Speak without waiting for a reply.
    pub async fn speak(&self, id: u64, text: &str) -> Result<()> {
        let session = self.get(id).await?;
        if session.is_hung_up() {
            self.cleanup(id).await;
            return Err(CallError::CallHungUp);
        }
        self.speak_streaming(&session, text).await?;
        session.push_history(Speaker::Assistant, text);
        Ok(())
    }

    /// Speak a farewell (optional), hang up, and release everything.
    /// Returns the call duration in seconds.
    pub async fn end(&self, id: u64, text: Option<&str>) -> Result<u64> {
        let session = self.get(id).await?;

        if let Some(text) = text {
            if !session.is_hung_up() {
                if let Err(e) = self.speak_streaming(&session, text).await {
                    tracing::warn!(session_id = id, error = %e, "Farewell synthesis failed");
                } else {
                    session.push_history(Speaker::Assistant, text);
                }
            }
        }
        tokio::time::sleep(HANGUP_DRAIN).await;

        if let Some(handle) = session.call_handle() {
            self.carrier.hangup(&handle).await;
        }
        session.mark_hung_up();
        let duration = session.started_at.elapsed().as_secs();
        self.cleanup(id).await;
        tracing::info!(session_id = id, duration_secs = duration, "Call ended");
        Ok(duration)
    }

    /// Stream-synthesize `text` through the jitter-buffered pacer.
    async fn speak_streaming(&self, session: &Arc<Session>, text: &str) -> Result<()> {
        let chunk_rx = self.tts.synthesize_stream(text).await?;
        let sink = SessionSink { session };
        pacer::pace_stream(chunk_rx, &sink).await?;
        tokio::time::sleep(POST_AUDIO_DRAIN).await;
        Ok(())
    }

    /// Poll until the media WebSocket is bound and the carrier reports
    /// the stream ready, or give up after [`CONNECT_TIMEOUT`].
    async fn wait_for_stream(&self, session: &Session) -> Result<()> {
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        loop {
            poll.tick().await;
            if session.is_hung_up() {
                return Err(CallError::CallHungUp);
            }
            if session.is_ws_open() && session.is_streaming_ready() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CallError::ConnectionTimeout(CONNECT_TIMEOUT.as_secs()));
            }
        }
    }

    // ── Webhook event routing ────────────────────────────────────

    /// Apply a normalized carrier event. Returns the streaming XML to
    /// answer with when the event was `CallAnswered` for a live
    /// session (variant A consumes it; variant B ignores the body and
    /// is told to start streaming through the adapter instead).
    pub async fn handle_carrier_event(&self, event: CarrierEvent) -> Option<String> {
        match event {
            CarrierEvent::CallAnswered { handle } => {
                let session = self.by_handle(&handle).await?;
                tracing::info!(session_id = session.id, "Call answered");
                let ws_url = self.media_ws_url(&session);
                let xml = self.carrier.streaming_xml(&ws_url);
                let carrier = Arc::clone(&self.carrier);
                tokio::spawn(async move {
                    if let Err(e) = carrier.start_stream(&handle, &ws_url).await {
                        tracing::warn!(error = %e, "Streaming start failed");
                    }
                });
                Some(xml)
            }
            CarrierEvent::CallHungUp { handle } => {
                if let Some(session) = self.by_handle(&handle).await {
                    tracing::info!(session_id = session.id, "Carrier reports hangup");
                    session.mark_hung_up();
                }
                None
            }
            CarrierEvent::StreamingReady { handle } => {
                if let Some(session) = self.by_handle(&handle).await {
                    session.mark_streaming_ready();
                }
                None
            }
            CarrierEvent::AnsweringMachine { handle, result } => {
                if let Some(session) = self.by_handle(&handle).await {
                    tracing::info!(
                        session_id = session.id,
                        result = %result,
                        "Answering machine detection"
                    );
                }
                None
            }
            CarrierEvent::Irrelevant => None,
        }
    }

    // ── Teardown ─────────────────────────────────────────────────

    /// Release everything a session owns and forget it. Idempotent:
    /// the first caller does the work, later callers find nothing.
    pub async fn cleanup(&self, id: u64) {
        let session = { self.table.lock().await.remove(id) };
        let Some(session) = session else { return };

        // The call may still be up (e.g. a connection timeout after a
        // successful placement); tear it down best-effort.
        if !session.is_hung_up() {
            if let Some(handle) = session.call_handle() {
                self.carrier.hangup(&handle).await;
            }
        }

        if let Some(stt) = session.take_stt() {
            stt.close();
        }

        let mut ws_out = session.ws_out.lock().await;
        if let Some(mut sink) = ws_out.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
        }
        session.set_ws_open(false);

        tracing::info!(session_id = id, "Session cleaned up");
    }
}

// ── Listening (the transcript/hangup race) ───────────────────────

/// Resolve as soon as the session's hangup flag is set.
async fn wait_for_hangup(session: &Session) {
    let mut poll = tokio::time::interval(POLL_INTERVAL);
    loop {
        poll.tick().await;
        if session.is_hung_up() {
            return;
        }
    }
}

/// Wait for the caller's next utterance, racing it against hangup.
///
/// Single-winner select: whichever side loses is dropped on scope
/// exit, so the hangup watcher's timer can never outlive this call.
/// Hangup wins ties — a transcript that arrives after the flag is set
/// is discarded.
pub(crate) async fn listen(session: &Session, timeout: Duration) -> Result<String> {
    if session.is_hung_up() {
        return Err(CallError::CallHungUp);
    }
    let stt = session
        .stt()
        .ok_or_else(|| CallError::Transport("no recognizer attached".into()))?;

    tokio::select! {
        result = stt.wait_for_transcript(timeout) => {
            if session.is_hung_up() {
                Err(CallError::CallHungUp)
            } else {
                result
            }
        }
        _ = wait_for_hangup(session) => Err(CallError::CallHungUp),
    }
}

// ── Outbound frames ──────────────────────────────────────────────

/// Write one μ-law frame to the session's media WebSocket. Drops the
/// frame silently when the stream isn't ready or the socket is gone —
/// hanging up while the assistant is mid-sentence must not error.
pub(crate) async fn send_media_frame(session: &Session, frame: &[u8]) -> Result<()> {
    if !session.can_send_media() {
        return Ok(());
    }

    let payload = base64::engine::general_purpose::STANDARD.encode(frame);
    let mut message = serde_json::json!({
        "event": "media",
        "media": { "payload": payload },
    });
    if let Some(sid) = session.stream_sid() {
        message["streamSid"] = serde_json::Value::String(sid);
    }

    let mut guard = session.ws_out.lock().await;
    if let Some(sink) = guard.as_mut() {
        if sink.send(WsMessage::Text(message.to_string().into())).await.is_err() {
            session.set_ws_open(false);
        }
    }
    Ok(())
}

struct SessionSink<'a> {
    session: &'a Arc<Session>,
}

#[async_trait]
impl FrameSink for SessionSink<'_> {
    async fn send_frame(&self, frame: &[u8]) -> Result<()> {
        send_media_frame(self.session, frame).await
    }
}

/// 32 random bytes, URL-safe base64: the media WebSocket bearer token.
fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}
