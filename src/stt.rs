//! Streaming speech-to-text session (Deepgram).
//!
//! One `SttSession` lives for the duration of a call and is reused
//! across turns. Caller audio is fed in as 20 ms μ-law frames exactly
//! as they come off the carrier wire (`encoding=mulaw&sample_rate=8000`
//! — no transcoding on this side); the recognizer's endpointing
//! finalizes an utterance after the configured end-of-utterance
//! silence.
//!
//! ## Protocol
//!
//! 1. **Connect** — WebSocket to `wss://api.deepgram.com/v1/listen`
//!    with `Authorization: Token <key>`.
//! 2. **Stream** — binary frames of raw μ-law; a `KeepAlive` text
//!    frame goes out while the line is quiet so the server doesn't
//!    drop us between turns.
//! 3. **Results** — JSON text frames; `is_final` segments accumulate
//!    until `speech_final` marks the end of the utterance.
//! 4. **Close** — `CloseStream` text frame, then the socket.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::error::{CallError, Result};

const DEEPGRAM_WS_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Idle keepalive cadence. Deepgram closes streams silent for ~10 s.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Connection parameters for a recognizer session.
#[derive(Debug, Clone)]
pub struct SttConfig {
    pub api_key: String,
    pub model: String,
    /// Silence that finalizes an utterance.
    pub eou_silence: Duration,
    /// WebSocket endpoint; overridable for tests.
    pub base_url: String,
}

impl SttConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>, eou_silence: Duration) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            eou_silence,
            base_url: DEEPGRAM_WS_URL.to_string(),
        }
    }
}

pub(crate) enum Outbound {
    Audio(Vec<u8>),
    Close,
}

/// A live streaming-recognizer connection.
pub struct SttSession {
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    transcript_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    closed: AtomicBool,
}

impl SttSession {
    /// Open the streaming connection and spawn its reader/writer tasks.
    pub async fn connect(session_id: u64, config: &SttConfig) -> Result<Self> {
        let url = format!(
            "{}?model={}&encoding=mulaw&sample_rate=8000&channels=1\
             &punctuate=true&interim_results=true&endpointing={}",
            config.base_url,
            config.model,
            config.eou_silence.as_millis()
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| CallError::Transport(format!("recognizer request: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", config.api_key)
                .parse()
                .map_err(|_| CallError::Transport("invalid recognizer auth header".into()))?,
        );

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| CallError::Transport(format!("recognizer connect: {e}")))?;
        tracing::info!(session_id, model = %config.model, "Recognizer connected");

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::outbound_loop(outbound_rx, ws_sender, session_id));
        tokio::spawn(Self::inbound_loop(ws_receiver, transcript_tx, session_id));

        Ok(Self {
            outbound_tx,
            transcript_rx: Mutex::new(transcript_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Enqueue a μ-law frame. Never blocks; frames sent after close are
    /// silently dropped.
    pub fn send_audio(&self, bytes: &[u8]) {
        if bytes.is_empty() || self.closed.load(Ordering::Relaxed) {
            return;
        }
        let _ = self.outbound_tx.send(Outbound::Audio(bytes.to_vec()));
    }

    /// Wait for the next finalized utterance.
    pub async fn wait_for_transcript(&self, timeout: Duration) -> Result<String> {
        let mut rx = self.transcript_rx.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(text)) => Ok(text),
            Ok(None) => Err(CallError::Transport("recognizer stream ended".into())),
            Err(_) => Err(CallError::TranscriptTimeout(timeout.as_secs())),
        }
    }

    /// Release the connection. Safe to call more than once.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.outbound_tx.send(Outbound::Close);
        }
    }

    async fn outbound_loop(
        mut rx: mpsc::UnboundedReceiver<Outbound>,
        mut ws_sender: futures_util::stream::SplitSink<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
            WsMessage,
        >,
        session_id: u64,
    ) {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(Outbound::Audio(bytes)) => {
                        if ws_sender.send(WsMessage::Binary(bytes)).await.is_err() {
                            tracing::warn!(session_id, "Recognizer send failed, closing writer");
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        let _ = ws_sender
                            .send(WsMessage::Text(r#"{"type":"CloseStream"}"#.to_string()))
                            .await;
                        let _ = ws_sender.send(WsMessage::Close(None)).await;
                        break;
                    }
                    None => break,
                },
                _ = keepalive.tick() => {
                    if ws_sender
                        .send(WsMessage::Text(r#"{"type":"KeepAlive"}"#.to_string()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }

        tracing::debug!(session_id, "Recognizer writer terminated");
    }

    async fn inbound_loop(
        mut ws_receiver: futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        >,
        transcript_tx: mpsc::UnboundedSender<String>,
        session_id: u64,
    ) {
        // is_final segments of the utterance in progress.
        let mut pending: Vec<String> = Vec::new();

        while let Some(msg_result) = ws_receiver.next().await {
            match msg_result {
                Ok(WsMessage::Text(text)) => match parse_recognizer_message(&text) {
                    RecognizerUpdate::Segment {
                        transcript,
                        is_final,
                        speech_final,
                    } => {
                        if is_final && !transcript.is_empty() {
                            pending.push(transcript);
                        }
                        if speech_final && !pending.is_empty() {
                            let utterance = pending.join(" ");
                            pending.clear();
                            tracing::info!(session_id, text = %utterance, "Utterance finalized");
                            if transcript_tx.send(utterance).is_err() {
                                return;
                            }
                        }
                    }
                    RecognizerUpdate::Error(message) => {
                        tracing::error!(session_id, error = %message, "Recognizer error");
                    }
                    RecognizerUpdate::Other => {}
                },
                Ok(WsMessage::Close(_)) => {
                    tracing::info!(session_id, "Recognizer connection closed");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(session_id, error = %e, "Recognizer WebSocket error");
                    break;
                }
            }
        }

        tracing::debug!(session_id, "Recognizer reader terminated");
    }

    /// Session backed by raw channels instead of a live socket, for
    /// exercising engine paths in tests.
    #[cfg(test)]
    pub(crate) fn for_tests() -> (Self, mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<Outbound>)
    {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound_tx,
                transcript_rx: Mutex::new(transcript_rx),
                closed: AtomicBool::new(false),
            },
            transcript_tx,
            outbound_rx,
        )
    }
}

/// What a recognizer text frame means to us.
#[derive(Debug, PartialEq)]
enum RecognizerUpdate {
    Segment {
        transcript: String,
        is_final: bool,
        speech_final: bool,
    },
    Error(String),
    Other,
}

fn parse_recognizer_message(text: &str) -> RecognizerUpdate {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => return RecognizerUpdate::Error(format!("unparseable recognizer frame: {e}")),
    };

    match value["type"].as_str() {
        Some("Results") => {
            let transcript = value["channel"]["alternatives"][0]["transcript"]
                .as_str()
                .unwrap_or("")
                .trim()
                .to_string();
            RecognizerUpdate::Segment {
                transcript,
                is_final: value["is_final"].as_bool().unwrap_or(false),
                speech_final: value["speech_final"].as_bool().unwrap_or(false),
            }
        }
        Some("Error") => RecognizerUpdate::Error(
            value["description"]
                .as_str()
                .or_else(|| value["message"].as_str())
                .unwrap_or("unknown recognizer error")
                .to_string(),
        ),
        _ => RecognizerUpdate::Other,
    }
}
