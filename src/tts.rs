//! Speech synthesis client (OpenAI `/v1/audio/speech`).
//!
//! Output is 16-bit little-endian linear PCM at 24 kHz, which the audio
//! module downsamples and companders for the carrier wire. Two shapes:
//! a unary call that returns the whole utterance, and a chunked stream
//! used mid-call to cut time-to-first-audio.

use tokio::sync::mpsc;

use crate::error::{CallError, Result};

const SPEECH_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Chunk channel depth for the streaming path. The pacer consumes in
/// real time; back-pressure belongs upstream.
const STREAM_CHANNEL_CAPACITY: usize = 32;

#[derive(Clone)]
pub struct TtsClient {
    client: reqwest::Client,
    api_key: String,
    voice: String,
    endpoint: String,
}

impl TtsClient {
    pub fn new(api_key: String, voice: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            voice,
            endpoint: SPEECH_URL.to_string(),
        }
    }

    #[cfg(test)]
    fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.to_string();
        self
    }

    async fn request(&self, text: &str) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "model": "tts-1",
                "input": text,
                "voice": self.voice,
                "response_format": "pcm",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("synthesis failed");
            return Err(CallError::provider("tts", status.as_u16(), message));
        }
        Ok(response)
    }

    /// Synthesize the whole utterance and return its PCM.
    pub async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        let response = self.request(text).await?;
        let bytes = response.bytes().await?;
        tracing::debug!(text_len = text.len(), pcm_bytes = bytes.len(), "Synthesis complete");
        Ok(bytes.to_vec())
    }

    /// Synthesize incrementally. Chunks arrive on the returned channel
    /// as the service produces them; the channel closes at end of
    /// stream or on a mid-stream error (logged).
    pub async fn synthesize_stream(&self, text: &str) -> Result<mpsc::Receiver<Vec<u8>>> {
        use futures_util::StreamExt;

        let response = self.request(text).await?;
        let (chunk_tx, chunk_rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                match chunk {
                    Ok(bytes) => {
                        if chunk_tx.send(bytes.to_vec()).await.is_err() {
                            // Consumer gone (call ended mid-utterance).
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Synthesis stream interrupted");
                        return;
                    }
                }
            }
        });

        Ok(chunk_rx)
    }
}
