//! Outbound audio pacing.
//!
//! The carrier expects real-time delivery: one 160-byte μ-law frame
//! every 20 ms, no faster. Synthesis output is bursty, so the
//! streaming path holds back until a 100 ms jitter buffer has filled,
//! then ticks frames out on the wall clock. The buffered path (used
//! for pre-generated audio) skips the fill wait but still paces.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::audio::{
    downsample_24k_to_8k, pcm_to_mulaw, FRAME_BYTES, FRAME_MS, PCM_BYTES_PER_OUTPUT_SAMPLE,
};
use crate::error::Result;

/// μ-law bytes that must accumulate before the first frame of an
/// utterance is transmitted (100 ms at 8 kHz).
pub const JITTER_BUFFER_BYTES: usize = 800;

/// Where paced frames go. The engine writes them to the carrier
/// WebSocket; tests record them with timestamps.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send_frame(&self, frame: &[u8]) -> Result<()>;
}

/// Incremental 24 kHz PCM → μ-law transcoder.
///
/// PCM is consumed in multiples of six bytes (one output sample's worth
/// of input); the remainder waits for the next chunk so no sample is
/// ever lost mid-stream.
#[derive(Default)]
pub struct MulawAccumulator {
    pending_pcm: Vec<u8>,
    pending_mulaw: Vec<u8>,
}

impl MulawAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_pcm(&mut self, chunk: &[u8]) {
        self.pending_pcm.extend_from_slice(chunk);
        let usable = self.pending_pcm.len() - self.pending_pcm.len() % PCM_BYTES_PER_OUTPUT_SAMPLE;
        if usable == 0 {
            return;
        }
        let pcm_8k = downsample_24k_to_8k(&self.pending_pcm[..usable]);
        self.pending_mulaw.extend(pcm_to_mulaw(&pcm_8k));
        self.pending_pcm.drain(..usable);
    }

    /// μ-law bytes ready to transmit.
    pub fn buffered(&self) -> usize {
        self.pending_mulaw.len()
    }

    /// Take one full wire frame, if available.
    pub fn pop_frame(&mut self) -> Option<Vec<u8>> {
        if self.pending_mulaw.len() < FRAME_BYTES {
            return None;
        }
        Some(self.pending_mulaw.drain(..FRAME_BYTES).collect())
    }

    /// Take whatever is left (the possibly-undersized tail frame).
    pub fn drain_tail(&mut self) -> Option<Vec<u8>> {
        if self.pending_mulaw.is_empty() {
            return None;
        }
        Some(std::mem::take(&mut self.pending_mulaw))
    }
}

/// Pace a fully-buffered μ-law utterance onto the wire: one frame per
/// 20 ms tick, first frame immediately.
pub async fn pace_buffered(mulaw: &[u8], sink: &dyn FrameSink) -> Result<()> {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(FRAME_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    for frame in mulaw.chunks(FRAME_BYTES) {
        ticker.tick().await;
        sink.send_frame(frame).await?;
    }
    Ok(())
}

/// Pace a live synthesis stream onto the wire.
///
/// Holds transmission until [`JITTER_BUFFER_BYTES`] have accumulated,
/// then ticks 160-byte frames at 20 ms wall-clock intervals while
/// chunks keep arriving. An underrun pauses transmission without
/// tightening the cadence; the tail is flushed when the producer ends.
pub async fn pace_stream(mut pcm_rx: mpsc::Receiver<Vec<u8>>, sink: &dyn FrameSink) -> Result<()> {
    let mut acc = MulawAccumulator::new();
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(FRAME_MS));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // Fill phase: nothing is transmitted until the jitter buffer holds
    // a full pre-roll or the producer finishes early.
    let mut stream_done = false;
    while acc.buffered() < JITTER_BUFFER_BYTES {
        match pcm_rx.recv().await {
            Some(chunk) => acc.push_pcm(&chunk),
            None => {
                stream_done = true;
                break;
            }
        }
    }
    ticker.reset();

    loop {
        tokio::select! {
            chunk = pcm_rx.recv(), if !stream_done => match chunk {
                Some(c) => acc.push_pcm(&c),
                None => stream_done = true,
            },
            _ = ticker.tick() => {
                if let Some(frame) = acc.pop_frame() {
                    sink.send_frame(&frame).await?;
                } else if stream_done {
                    break;
                }
                // Underrun with a live producer: hold the cadence and
                // wait for more audio.
            }
        }
    }

    if let Some(tail) = acc.drain_tail() {
        sink.send_frame(&tail).await?;
    }
    Ok(())
}
