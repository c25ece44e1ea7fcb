//! Live call sessions.
//!
//! A [`Session`] is one active phone call: its identity, the carrier
//! handle, the media-stream binding, and the resources it owns (the
//! recognizer connection and the outbound WebSocket sink). The
//! [`SessionTable`] is the process-wide registry with two sub-indices
//! (carrier handle, WebSocket token); every mutation goes through one
//! lock so the indices can never point at a session that is not live.

pub mod engine;
pub mod pacer;

pub use engine::SessionEngine;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::stream::SplitSink;
use tokio::sync::Mutex as AsyncMutex;

use crate::stt::SttSession;

/// Outbound half of the carrier media WebSocket.
pub type MediaSink = SplitSink<WebSocket, WsMessage>;

/// Who said an utterance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Assistant,
    User,
}

/// One active call.
pub struct Session {
    /// Monotonic process-local identifier.
    pub id: u64,
    /// Token binding the inbound media WebSocket to this session.
    pub token: String,
    pub to: String,
    pub from: String,
    /// Whether outbound frames must carry the stream sub-identifier.
    pub require_stream_sid: bool,
    pub started_at: Instant,

    call_handle: parking_lot::Mutex<Option<String>>,
    stream_sid: parking_lot::Mutex<Option<String>>,
    streaming_ready: AtomicBool,
    hung_up: AtomicBool,
    ws_open: AtomicBool,
    history: parking_lot::Mutex<Vec<(Speaker, String)>>,

    stt: parking_lot::Mutex<Option<Arc<SttSession>>>,
    pub(crate) ws_out: AsyncMutex<Option<MediaSink>>,
}

impl Session {
    pub fn new(id: u64, token: String, to: String, from: String, require_stream_sid: bool) -> Self {
        Self {
            id,
            token,
            to,
            from,
            require_stream_sid,
            started_at: Instant::now(),
            call_handle: parking_lot::Mutex::new(None),
            stream_sid: parking_lot::Mutex::new(None),
            streaming_ready: AtomicBool::new(false),
            hung_up: AtomicBool::new(false),
            ws_open: AtomicBool::new(false),
            history: parking_lot::Mutex::new(Vec::new()),
            stt: parking_lot::Mutex::new(None),
            ws_out: AsyncMutex::new(None),
        }
    }

    pub fn call_handle(&self) -> Option<String> {
        self.call_handle.lock().clone()
    }

    pub fn set_call_handle(&self, handle: String) {
        *self.call_handle.lock() = Some(handle);
    }

    pub fn stream_sid(&self) -> Option<String> {
        self.stream_sid.lock().clone()
    }

    /// Record the carrier's stream sub-identifier and latch readiness:
    /// a `start` message means audio is flowing.
    pub fn set_stream_sid(&self, sid: String) {
        *self.stream_sid.lock() = Some(sid);
        self.streaming_ready.store(true, Ordering::SeqCst);
    }

    pub fn mark_streaming_ready(&self) {
        self.streaming_ready.store(true, Ordering::SeqCst);
    }

    pub fn is_streaming_ready(&self) -> bool {
        self.streaming_ready.load(Ordering::SeqCst)
    }

    pub fn mark_hung_up(&self) {
        self.hung_up.store(true, Ordering::SeqCst);
    }

    pub fn is_hung_up(&self) -> bool {
        self.hung_up.load(Ordering::SeqCst)
    }

    pub fn set_ws_open(&self, open: bool) {
        self.ws_open.store(open, Ordering::SeqCst);
    }

    pub fn is_ws_open(&self) -> bool {
        self.ws_open.load(Ordering::SeqCst)
    }

    pub fn set_stt(&self, stt: Arc<SttSession>) {
        *self.stt.lock() = Some(stt);
    }

    pub fn stt(&self) -> Option<Arc<SttSession>> {
        self.stt.lock().clone()
    }

    pub fn take_stt(&self) -> Option<Arc<SttSession>> {
        self.stt.lock().take()
    }

    /// Feed caller audio into the recognizer, if one is attached.
    pub fn feed_caller_audio(&self, bytes: &[u8]) {
        if let Some(stt) = self.stt() {
            stt.send_audio(bytes);
        }
    }

    pub fn push_history(&self, speaker: Speaker, text: &str) {
        self.history.lock().push((speaker, text.to_string()));
    }

    pub fn history(&self) -> Vec<(Speaker, String)> {
        self.history.lock().clone()
    }

    /// Whether an outbound media frame may be written right now.
    pub fn can_send_media(&self) -> bool {
        self.is_streaming_ready()
            && self.is_ws_open()
            && (!self.require_stream_sid || self.stream_sid().is_some())
    }
}

/// The live-session map plus its two strict sub-indices.
#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<u64, Arc<Session>>,
    by_handle: HashMap<String, u64>,
    by_token: HashMap<String, u64>,
}

impl SessionTable {
    pub fn insert(&mut self, session: Arc<Session>) {
        self.by_token.insert(session.token.clone(), session.id);
        self.sessions.insert(session.id, session);
    }

    /// Index the carrier handle once the carrier acknowledges the call.
    pub fn index_handle(&mut self, id: u64, handle: &str) {
        if self.sessions.contains_key(&id) {
            self.by_handle.insert(handle.to_string(), id);
        }
    }

    pub fn get(&self, id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&id).cloned()
    }

    pub fn by_token(&self, token: &str) -> Option<Arc<Session>> {
        self.by_token.get(token).and_then(|id| self.get(*id))
    }

    pub fn by_handle(&self, handle: &str) -> Option<Arc<Session>> {
        self.by_handle.get(handle).and_then(|id| self.get(*id))
    }

    /// Remove a session and every index entry pointing at it.
    pub fn remove(&mut self, id: u64) -> Option<Arc<Session>> {
        let session = self.sessions.remove(&id)?;
        self.by_token.remove(&session.token);
        if let Some(handle) = session.call_handle() {
            self.by_handle.remove(&handle);
        }
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
