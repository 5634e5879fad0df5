//! # Microphone Capture and Encoding
//!
//! Converts live microphone samples into the agent's wire format:
//! mono 16-bit signed little-endian PCM, base64 (standard alphabet), one chunk per
//! fixed-size frame.
//!
//! ## Sample Conversion:
//! `pcm = round(clamp(s, -1, 1) * (s < 0 ? 32768 : 32767))`
//!
//! The scale is asymmetric so that both -1.0 and 1.0 hit the i16 extremes.
//! NaN encodes as silence.
//!
//! ## Framing:
//! Devices deliver buffers of arbitrary length. [`AudioCaptureEncoder`] accumulates
//! them and emits exactly one [`OutboundChunk`] per complete frame, in capture order.
//! A trailing partial frame at stop is discarded.

use crate::audio::buffer::{OutboundQueue, PushOutcome};
use crate::audio::device::{AudioDevice, CaptureConfig, InputStream};
use crate::voice::error::VoiceResult;
use crate::voice::protocol::OutboundMessage;
use crate::voice::stats::SessionStats;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use byteorder::{ByteOrder, LittleEndian};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One fixed-size block of mono samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    /// Base64 of the PCM16LE encoding of this frame.
    pub fn encode(&self) -> String {
        STANDARD.encode(encode_pcm16le(&self.samples))
    }
}

/// Convert one float sample to 16-bit PCM.
pub fn sample_to_pcm16(sample: f32) -> i16 {
    if sample.is_nan() {
        return 0;
    }
    let s = sample.clamp(-1.0, 1.0);
    let scaled = if s < 0.0 { s * 32768.0 } else { s * 32767.0 };
    scaled.round() as i16
}

pub fn encode_pcm16le(samples: &[f32]) -> Vec<u8> {
    let pcm: Vec<i16> = samples.iter().copied().map(sample_to_pcm16).collect();
    let mut bytes = vec![0u8; pcm.len() * 2];
    LittleEndian::write_i16_into(&pcm, &mut bytes);
    bytes
}

/// An encoded frame waiting to be sent. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundChunk {
    /// Position in capture order, starting at 0 for each session.
    pub sequence: u64,
    pub sample_count: usize,
    /// Base64 PCM16LE.
    pub payload: String,
}

impl OutboundChunk {
    pub fn into_message(self) -> OutboundMessage {
        OutboundMessage::audio_chunk(self.payload)
    }
}

/// Accumulates device buffers into frames and pushes encoded chunks to the
/// outbound queue. Lives inside the capture callback.
pub struct AudioCaptureEncoder {
    frame_size: usize,
    sample_rate: Arc<AtomicU32>,
    pending: Vec<f32>,
    next_sequence: u64,
    queue: Arc<OutboundQueue>,
    stats: Arc<SessionStats>,
}

impl AudioCaptureEncoder {
    pub fn new(
        frame_size: usize,
        sample_rate: u32,
        queue: Arc<OutboundQueue>,
        stats: Arc<SessionStats>,
    ) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            sample_rate: Arc::new(AtomicU32::new(sample_rate)),
            pending: Vec::with_capacity(frame_size),
            next_sequence: 0,
            queue,
            stats,
        }
    }

    /// Shared cell holding the rate stamped on frames; updated once the device
    /// reports what it actually opened.
    pub fn sample_rate_handle(&self) -> Arc<AtomicU32> {
        self.sample_rate.clone()
    }

    /// Feed one device buffer. Never blocks.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let mut rest = samples;
        while !rest.is_empty() {
            let wanted = self.frame_size - self.pending.len();
            let take = wanted.min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if self.pending.len() == self.frame_size {
                let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                self.emit(AudioFrame {
                    samples,
                    sample_rate: self.sample_rate.load(Ordering::Relaxed),
                });
            }
        }
    }

    fn emit(&mut self, frame: AudioFrame) {
        let chunk = OutboundChunk {
            sequence: self.next_sequence,
            sample_count: frame.samples.len(),
            payload: frame.encode(),
        };
        self.next_sequence += 1;
        SessionStats::bump(&self.stats.frames_captured);

        if self.queue.push(chunk) == PushOutcome::Closed {
            tracing::trace!("Outbound queue closed, frame discarded");
        }
    }

    /// Samples held back waiting for a full frame.
    #[cfg(test)]
    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }

    #[cfg(test)]
    pub fn frames_emitted(&self) -> u64 {
        self.next_sequence
    }
}

/// Exclusive microphone capture for one Streaming period.
///
/// Dropping the stream stops the device callback and releases the microphone.
pub struct CaptureStream {
    stream: Box<dyn InputStream>,
    sample_rate: u32,
}

impl CaptureStream {
    pub fn start(
        device: &dyn AudioDevice,
        config: &CaptureConfig,
        encoder: AudioCaptureEncoder,
    ) -> VoiceResult<Self> {
        let rate_cell = encoder.sample_rate_handle();
        let encoder = Arc::new(Mutex::new(encoder));

        let callback_encoder = encoder.clone();
        let stream = device.open_input(
            config,
            Box::new(move |samples: &[f32]| {
                callback_encoder
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_samples(samples);
            }),
        )?;

        let sample_rate = stream.sample_rate();
        rate_cell.store(sample_rate, Ordering::Relaxed);
        if sample_rate != config.sample_rate {
            tracing::warn!(
                requested = config.sample_rate,
                actual = sample_rate,
                "Microphone opened at a different sample rate"
            );
        }
        tracing::info!(
            device = device.name(),
            sample_rate,
            frame_size = config.frame_size,
            "Microphone capture started"
        );

        Ok(Self { stream, sample_rate })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for CaptureStream {
    fn drop(&mut self) {
        tracing::info!(sample_rate = self.stream.sample_rate(), "Microphone capture stopped");
    }
}
