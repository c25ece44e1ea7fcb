//! Stdio JSON-RPC 2.0 tool dispatcher.
//!
//! The upstream assistant drives the process over stdin/stdout with
//! length-prefixed frames (`Content-Length: N\r\n\r\n<body>`). The
//! protocol surface is small: `initialize`, `tools/list` with a fixed
//! catalog, and `tools/call`. Tool failures come back as structured
//! tool-error payloads — a failed call never takes the process down.
//!
//! The dispatcher is generic over a [`ToolBackend`] so the voice
//! engine and the text-chat engine expose the same tool shape.

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CallError, Result};

/// One entry in the tool catalog.
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

/// What the dispatcher drives: either the voice session engine or the
/// text-chat engine.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    fn tools(&self) -> Vec<ToolSpec>;
    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value>;
}

/// Serve the backend over a framed byte stream until EOF.
pub async fn run<R, W>(backend: &dyn ToolBackend, mut reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(raw) = read_frame(&mut reader).await? {
        let request: Value = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(e) => {
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": Value::Null,
                    "error": { "code": -32700, "message": format!("parse error: {e}") },
                });
                write_frame(&mut writer, &response).await?;
                continue;
            }
        };

        let Some(id) = request.get("id").filter(|v| !v.is_null()).cloned() else {
            // Notification: nothing to answer.
            continue;
        };
        let method = request["method"].as_str().unwrap_or("");
        tracing::debug!(method, "Tool request");

        let response = match dispatch(backend, method, &request["params"]).await {
            Ok(result) => json!({ "jsonrpc": "2.0", "id": id, "result": result }),
            Err((code, message)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": message },
            }),
        };
        write_frame(&mut writer, &response).await?;
    }
    tracing::info!("Assistant transport closed");
    Ok(())
}

async fn dispatch(
    backend: &dyn ToolBackend,
    method: &str,
    params: &Value,
) -> std::result::Result<Value, (i64, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "serverInfo": {
                "name": "callclaw",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "capabilities": { "tools": {} },
        })),
        "tools/list" => {
            let tools: Vec<Value> = backend
                .tools()
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": t.input_schema,
                    })
                })
                .collect();
            Ok(json!({ "tools": tools }))
        }
        "tools/call" => {
            let name = params["name"]
                .as_str()
                .ok_or((-32602, "missing tool name".to_string()))?;
            let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));
            match backend.call_tool(name, &arguments).await {
                Ok(result) => Ok(json!({
                    "content": [ { "type": "text", "text": result.to_string() } ],
                })),
                Err(e) => {
                    tracing::warn!(tool = name, error = %e, "Tool call failed");
                    Ok(json!({
                        "content": [ { "type": "text", "text": e.to_string() } ],
                        "isError": true,
                    }))
                }
            }
        }
        other => Err((-32601, format!("method not found: {other}"))),
    }
}

// ── Framing ──────────────────────────────────────────────────────

async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> anyhow::Result<Option<Vec<u8>>> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None); // EOF
        }
        let line = line.trim_end();
        if line.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue; // stray blank line between frames
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok();
            }
            // Content-Type and anything else: ignored.
        }
    }

    let len = content_length.ok_or_else(|| anyhow::anyhow!("frame missing Content-Length"))?;
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &Value) -> anyhow::Result<()> {
    let payload = serde_json::to_vec(body)?;
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

// ── Voice backend ────────────────────────────────────────────────

/// Maps the fixed tool set onto the voice session engine.
pub struct VoiceToolBackend {
    engine: std::sync::Arc<crate::session::SessionEngine>,
}

impl VoiceToolBackend {
    pub fn new(engine: std::sync::Arc<crate::session::SessionEngine>) -> Self {
        Self { engine }
    }
}

fn str_arg<'a>(arguments: &'a Value, name: &str) -> Result<&'a str> {
    arguments[name]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CallError::Protocol(format!("missing argument: {name}")))
}

fn session_arg(arguments: &Value) -> Result<u64> {
    arguments["session_id"]
        .as_u64()
        .ok_or_else(|| CallError::Protocol("missing argument: session_id".into()))
}

#[async_trait]
impl ToolBackend for VoiceToolBackend {
    fn tools(&self) -> Vec<ToolSpec> {
        vec![
            ToolSpec {
                name: "initiate_call",
                description: "Place a phone call to the user, speak the opening message, and \
                              return what they say back.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "message": { "type": "string", "description": "Opening line to speak" }
                    },
                    "required": ["message"]
                }),
            },
            ToolSpec {
                name: "continue_call",
                description: "Speak on an active call and return the user's reply.",
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
                description: "Speak on an active call without waiting for a reply.",
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
                description: "Speak an optional goodbye, hang up, and report the call duration.",
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "session_id": { "type": "integer" },
                        "message": { "type": "string" }
                    },
                    "required": ["session_id"]
                }),
            },
        ]
    }

    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value> {
        match name {
            "initiate_call" => {
                let message = str_arg(arguments, "message")?;
                let (session_id, transcript) = self.engine.initiate(message).await?;
                Ok(json!({ "session_id": session_id, "transcript": transcript }))
            }
            "continue_call" => {
                let id = session_arg(arguments)?;
                let message = str_arg(arguments, "message")?;
                let transcript = self.engine.continue_call(id, message).await?;
                Ok(json!({ "transcript": transcript }))
            }
            "speak_to_user" => {
                let id = session_arg(arguments)?;
                let message = str_arg(arguments, "message")?;
                self.engine.speak(id, message).await?;
                Ok(json!({ "status": "ok" }))
            }
            "end_call" => {
                let id = session_arg(arguments)?;
                let message = arguments["message"].as_str().filter(|s| !s.is_empty());
                let duration_secs = self.engine.end(id, message).await?;
                Ok(json!({ "duration_secs": duration_secs }))
            }
            other => Err(CallError::Protocol(format!("unknown tool: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct EchoBackend;

    #[async_trait]
    impl ToolBackend for EchoBackend {
        fn tools(&self) -> Vec<ToolSpec> {
            vec![ToolSpec {
                name: "echo",
                description: "Echo the message back.",
                input_schema: json!({ "type": "object" }),
            }]
        }

        async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value> {
            match name {
                "echo" => Ok(json!({ "echo": arguments["message"] })),
                other => Err(CallError::Protocol(format!("unknown tool: {other}"))),
            }
        }
    }

    fn frame(body: &Value) -> Vec<u8> {
        let payload = body.to_string();
        format!("Content-Length: {}\r\n\r\n{payload}", payload.len()).into_bytes()
    }

    /// Decode every response frame from the captured output.
    fn decode_frames(mut bytes: &[u8]) -> Vec<Value> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let text = std::str::from_utf8(bytes).unwrap();
            let header_end = text.find("\r\n\r\n").unwrap();
            let len: usize = text[..header_end]
                .strip_prefix("Content-Length:")
                .unwrap()
                .trim()
                .parse()
                .unwrap();
            let body_start = header_end + 4;
            out.push(serde_json::from_slice(&bytes[body_start..body_start + len]).unwrap());
            bytes = &bytes[body_start + len..];
        }
        out
    }

    async fn roundtrip(requests: &[Value]) -> Vec<Value> {
        let mut input = Vec::new();
        for r in requests {
            input.extend(frame(r));
        }
        let mut output = Cursor::new(Vec::new());
        run(&EchoBackend, tokio::io::BufReader::new(&input[..]), &mut output)
            .await
            .unwrap();
        decode_frames(output.get_ref())
    }

    #[tokio::test]
    async fn initialize_handshake() {
        let responses = roundtrip(&[json!({
            "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}
        })])
        .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["result"]["serverInfo"]["name"], "callclaw");
    }

    #[tokio::test]
    async fn tools_list_returns_catalog() {
        let responses = roundtrip(&[json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/list"
        })])
        .await;
        let tools = responses[0]["result"]["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "echo");
        assert!(tools[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn tool_call_roundtrip() {
        let responses = roundtrip(&[json!({
            "jsonrpc": "2.0", "id": 3, "method": "tools/call",
            "params": { "name": "echo", "arguments": { "message": "hello" } }
        })])
        .await;
        let content = &responses[0]["result"]["content"][0];
        assert_eq!(content["type"], "text");
        let inner: Value = serde_json::from_str(content["text"].as_str().unwrap()).unwrap();
        assert_eq!(inner["echo"], "hello");
        assert!(responses[0]["result"]["isError"].is_null());
    }

    #[tokio::test]
    async fn failed_tool_is_an_error_payload_not_a_crash() {
        let responses = roundtrip(&[
            json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": { "name": "no_such_tool", "arguments": {} }
            }),
            // The dispatcher keeps serving after the failure.
            json!({
                "jsonrpc": "2.0", "id": 5, "method": "tools/call",
                "params": { "name": "echo", "arguments": { "message": "still alive" } }
            }),
        ])
        .await;

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["result"]["isError"], true);
        assert!(responses[0]["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("unknown tool"));
        assert!(responses[1]["result"]["isError"].is_null());
    }

    #[tokio::test]
    async fn unknown_method_is_jsonrpc_error() {
        let responses = roundtrip(&[json!({
            "jsonrpc": "2.0", "id": 6, "method": "resources/list"
        })])
        .await;
        assert_eq!(responses[0]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notifications_are_ignored() {
        let responses = roundtrip(&[
            json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
            json!({ "jsonrpc": "2.0", "id": 7, "method": "tools/list" }),
        ])
        .await;
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], 7);
    }

    #[tokio::test]
    async fn voice_backend_exposes_fixed_tool_set() {
        use crate::carrier::twilio::TwilioAdapter;
        use crate::session::engine::EngineSettings;
        use crate::session::SessionEngine;
        use crate::stt::SttConfig;
        use crate::tts::TtsClient;
        use std::sync::Arc;
        use std::time::Duration;

        let engine = Arc::new(SessionEngine::new(
            Arc::new(TwilioAdapter::new("AC123".into(), "secret".into())),
            TtsClient::new("sk-test".into(), "alloy".into()),
            SttConfig::new("dg-test", "nova-2", Duration::from_millis(800)),
            EngineSettings {
                to_number: "+15550002222".into(),
                from_number: "+15550001111".into(),
                public_base_url: "https://x.example".into(),
                media_stream_base: "wss://x.example/media-stream".into(),
                transcript_timeout: Duration::from_secs(180),
                require_stream_sid: false,
            },
        ));
        let backend = VoiceToolBackend::new(engine);

        let names: Vec<&str> = backend.tools().iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            ["initiate_call", "continue_call", "speak_to_user", "end_call"]
        );

        // continue_call on a dead id surfaces as a CallError, which the
        // dispatch layer wraps into a tool-error payload.
        let err = backend
            .call_tool("continue_call", &json!({ "session_id": 9, "message": "hi" }))
            .await
            .unwrap_err();
        assert!(matches!(err, CallError::NoSuchSession(9)));
    }
}
