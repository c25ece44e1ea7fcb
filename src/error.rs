//! Error taxonomy for CallClaw.
//!
//! Every failure the session engine, carrier adapters, or external
//! services can produce is one of these variants. The tool dispatcher
//! maps them into structured tool-error payloads; the HTTP layer maps
//! `Signature` to 401 and body-parse failures to 400. Only
//! `Config` at startup is fatal to the process.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallError {
    /// Missing or malformed configuration. Carries every problem found
    /// so the operator fixes them in one pass.
    #[error("configuration error:\n{}", .0.join("\n"))]
    Config(Vec<String>),

    /// Non-2xx from the carrier, TTS, or STT service.
    #[error("{service} error ({status}): {message}")]
    Provider {
        service: &'static str,
        status: u16,
        message: String,
    },

    /// Webhook signature rejected. Never reaches the session engine.
    #[error("webhook signature verification failed")]
    Signature,

    /// The media WebSocket did not become ready within the connection window.
    #[error("media stream did not connect within {0} seconds")]
    ConnectionTimeout(u64),

    /// The recognizer produced no finalized utterance within the listen window.
    #[error("no transcript within {0} seconds")]
    TranscriptTimeout(u64),

    /// The caller hung up (carrier event or media-stream stop).
    #[error("call hung up")]
    CallHungUp,

    /// Operation referenced a session that is not live.
    #[error("no such session: {0}")]
    NoSuchSession(u64),

    /// Malformed inbound message. Logged and discarded, never fatal to
    /// a connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport-level failure (HTTP or WebSocket I/O).
    #[error("transport error: {0}")]
    Transport(String),
}

impl CallError {
    /// Provider error from a reqwest response that already failed the
    /// status check.
    pub fn provider(service: &'static str, status: u16, message: impl Into<String>) -> Self {
        Self::Provider {
            service,
            status,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CallError>;
