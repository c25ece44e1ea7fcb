//! The carrier media-stream WebSocket endpoint.
//!
//! The carrier connects here (URL handed to it in the streaming XML or
//! the streaming-start action) carrying the session's bearer token as
//! a query parameter. After a constant-time token check the socket is
//! bound to its session: the sink half is stored on the session record
//! for outbound frames, and this module's read loop demultiplexes the
//! inbound control messages.
//!
//! Inbound frames are a small tagged union — `start` (carries the
//! stream sub-identifier), `media` (base64 audio with a track label),
//! `stop` — parsed at the boundary. Malformed JSON is logged and
//! dropped; it never tears the connection down.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::Engine as _;
use futures_util::StreamExt;

use super::AppState;
use crate::carrier::constant_time_eq;
use crate::session::Session;

/// One inbound control message, parsed at the boundary.
#[derive(Debug, PartialEq)]
enum MediaStreamMessage {
    Start { stream_sid: String },
    Media { payload: Vec<u8>, inbound: bool },
    Stop,
    Other,
}

/// GET /media-stream?token=… — WebSocket upgrade.
pub async fn handle_media_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = params.get("token") else {
        tracing::warn!("Media stream rejected: missing token");
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let Some(session) = state.engine.session_by_token(token).await else {
        tracing::warn!("Media stream rejected: unknown token");
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    };

    if !constant_time_eq(token.as_bytes(), session.token.as_bytes()) {
        tracing::warn!(session_id = session.id, "Media stream rejected: token mismatch");
        return (StatusCode::UNAUTHORIZED, "invalid token").into_response();
    }

    ws.on_upgrade(move |socket| media_stream_loop(socket, session))
}

/// Read loop for one bound media stream.
async fn media_stream_loop(socket: WebSocket, session: Arc<Session>) {
    let (sink, mut stream) = socket.split();
    *session.ws_out.lock().await = Some(sink);
    session.set_ws_open(true);
    tracing::info!(session_id = session.id, "Media stream connected");

    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => match parse_media_message(&text) {
                MediaStreamMessage::Start { stream_sid } => {
                    tracing::info!(
                        session_id = session.id,
                        stream_sid = %stream_sid,
                        "Media stream started"
                    );
                    session.set_stream_sid(stream_sid);
                }
                MediaStreamMessage::Media {
                    payload,
                    inbound: true,
                } => {
                    session.feed_caller_audio(&payload);
                }
                MediaStreamMessage::Media { inbound: false, .. } => {
                    // Our own outbound track echoed back; not caller voice.
                }
                MediaStreamMessage::Stop => {
                    tracing::info!(session_id = session.id, "Media stream stop event");
                    session.mark_hung_up();
                }
                MediaStreamMessage::Other => {}
            },
            Ok(Message::Close(_)) => {
                tracing::info!(session_id = session.id, "Media stream closed by carrier");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(session_id = session.id, error = %e, "Media stream read error");
                break;
            }
        }
    }

    session.set_ws_open(false);
    tracing::info!(session_id = session.id, "Media stream disconnected");
}

fn parse_media_message(text: &str) -> MediaStreamMessage {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "Unparseable media-stream frame");
            return MediaStreamMessage::Other;
        }
    };

    match value["event"].as_str() {
        Some("start") => {
            // Twilio carries the sub-identifier both at the top level
            // and under `start`; Telnyx calls it `stream_id`.
            let sid = value["streamSid"]
                .as_str()
                .or_else(|| value["start"]["streamSid"].as_str())
                .or_else(|| value["stream_id"].as_str());
            match sid {
                Some(s) => MediaStreamMessage::Start {
                    stream_sid: s.to_string(),
                },
                None => MediaStreamMessage::Other,
            }
        }
        Some("media") => {
            let track = value["media"]["track"].as_str().unwrap_or("inbound");
            let inbound = track == "inbound" || track == "inbound_track";
            let Some(payload_b64) = value["media"]["payload"].as_str() else {
                return MediaStreamMessage::Other;
            };
            match base64::engine::general_purpose::STANDARD.decode(payload_b64) {
                Ok(payload) => MediaStreamMessage::Media { payload, inbound },
                Err(e) => {
                    tracing::warn!(error = %e, "Undecodable media payload");
                    MediaStreamMessage::Other
                }
            }
        }
        Some("stop") => MediaStreamMessage::Stop,
        _ => MediaStreamMessage::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_start_twilio_shape() {
        let msg = parse_media_message(
            r#"{"event":"start","sequenceNumber":"1","start":{"streamSid":"MZ123","accountSid":"AC1"},"streamSid":"MZ123"}"#,
        );
        assert_eq!(
            msg,
            MediaStreamMessage::Start {
                stream_sid: "MZ123".into()
            }
        );
    }

    #[test]
    fn parse_start_nested_only() {
        let msg = parse_media_message(r#"{"event":"start","start":{"streamSid":"MZ9"}}"#);
        assert_eq!(
            msg,
            MediaStreamMessage::Start {
                stream_sid: "MZ9".into()
            }
        );
    }

    #[test]
    fn parse_start_telnyx_shape() {
        let msg = parse_media_message(r#"{"event":"start","stream_id":"st-42"}"#);
        assert_eq!(
            msg,
            MediaStreamMessage::Start {
                stream_sid: "st-42".into()
            }
        );
    }

    #[test]
    fn parse_inbound_media() {
        let payload = base64::engine::general_purpose::STANDARD.encode([0xFFu8, 0x7F, 0x00]);
        let text = format!(
            r#"{{"event":"media","media":{{"track":"inbound","payload":"{payload}"}}}}"#
        );
        let msg = parse_media_message(&text);
        assert_eq!(
            msg,
            MediaStreamMessage::Media {
                payload: vec![0xFF, 0x7F, 0x00],
                inbound: true
            }
        );
    }

    #[test]
    fn parse_inbound_track_label_variant() {
        let payload = base64::engine::general_purpose::STANDARD.encode([1u8]);
        let text = format!(
            r#"{{"event":"media","media":{{"track":"inbound_track","payload":"{payload}"}}}}"#
        );
        assert!(matches!(
            parse_media_message(&text),
            MediaStreamMessage::Media { inbound: true, .. }
        ));
    }

    #[test]
    fn parse_outbound_media_flagged() {
        let payload = base64::engine::general_purpose::STANDARD.encode([1u8]);
        let text = format!(
            r#"{{"event":"media","media":{{"track":"outbound","payload":"{payload}"}}}}"#
        );
        assert!(matches!(
            parse_media_message(&text),
            MediaStreamMessage::Media { inbound: false, .. }
        ));
    }

    #[test]
    fn parse_stop() {
        assert_eq!(
            parse_media_message(r#"{"event":"stop"}"#),
            MediaStreamMessage::Stop
        );
    }

    #[test]
    fn malformed_frames_are_other_not_fatal() {
        assert_eq!(parse_media_message("not json"), MediaStreamMessage::Other);
        assert_eq!(parse_media_message("{}"), MediaStreamMessage::Other);
        assert_eq!(
            parse_media_message(r#"{"event":"start"}"#),
            MediaStreamMessage::Other
        );
        assert_eq!(
            parse_media_message(r#"{"event":"media","media":{"payload":"!!!"}}"#),
            MediaStreamMessage::Other
        );
        assert_eq!(
            parse_media_message(r#"{"event":"mark"}"#),
            MediaStreamMessage::Other
        );
    }
}
