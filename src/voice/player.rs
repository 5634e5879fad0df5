//! # Inbound Audio Player
//!
//! Plays the agent's `audio` frames. Dispatch only enqueues the base64 payload; a
//! dedicated task decodes it (on the blocking pool) and hands the samples to the
//! output sink, so a slow decode never holds up pings or transcript updates.
//!
//! ## Playback modes:
//! - **overlap** (default): each clip starts as soon as it is decoded, on top of
//!   whatever is still playing
//! - **serialize**: each clip waits until the previous clip's duration has elapsed

use crate::audio::decoder::{decode_clip, DecodedAudio};
use crate::audio::device::OutputSink;
use crate::voice::error::{VoiceError, VoiceResult};
use crate::voice::stats::SessionStats;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackMode {
    #[default]
    Overlap,
    Serialize,
}

/// Base64 text → container bytes → samples.
pub fn decode_payload(audio_base64: &str) -> VoiceResult<DecodedAudio> {
    let bytes = STANDARD
        .decode(audio_base64.trim())
        .map_err(|e| VoiceError::DecodeError(format!("invalid base64: {}", e)))?;
    decode_clip(bytes)
}

/// Cloneable enqueue side of the player.
#[derive(Clone)]
pub struct PlayerHandle {
    clips: mpsc::Sender<String>,
    stats: Arc<SessionStats>,
}

impl PlayerHandle {
    /// Queue a clip for playback without waiting. Returns `false` if the clip was
    /// dropped because the player is full or stopped.
    pub fn enqueue(&self, audio_base64: String) -> bool {
        match self.clips.try_send(audio_base64) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                SessionStats::bump(&self.stats.clips_dropped);
                tracing::warn!("Playback queue full, dropping agent audio clip");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Player stopped, dropping agent audio clip");
                false
            }
        }
    }
}

pub struct InboundAudioPlayer {
    handle: PlayerHandle,
    task: JoinHandle<()>,
}

impl InboundAudioPlayer {
    /// Spawn the player task on the current runtime.
    pub fn start(
        sink: Arc<dyn OutputSink>,
        mode: PlaybackMode,
        capacity: usize,
        stats: Arc<SessionStats>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let task = tokio::spawn(run_player(rx, sink, mode, stats.clone()));
        tracing::debug!(?mode, capacity, "Audio player started");

        Self {
            handle: PlayerHandle { clips: tx, stats },
            task,
        }
    }

    pub fn handle(&self) -> PlayerHandle {
        self.handle.clone()
    }

    /// End the player task. Clips already handed to the sink keep playing; queued
    /// ones are discarded.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for InboundAudioPlayer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_player(
    mut clips: mpsc::Receiver<String>,
    sink: Arc<dyn OutputSink>,
    mode: PlaybackMode,
    stats: Arc<SessionStats>,
) {
    let mut busy_until: Option<Instant> = None;

    while let Some(audio_base64) = clips.recv().await {
        let decoded = tokio::task::spawn_blocking(move || decode_payload(&audio_base64)).await;
        let clip = match decoded {
            Ok(Ok(clip)) => clip,
            Ok(Err(e)) => {
                SessionStats::bump(&stats.decode_errors);
                tracing::warn!("Dropping agent audio: {}", e);
                continue;
            }
            Err(e) => {
                SessionStats::bump(&stats.decode_errors);
                tracing::error!("Audio decode task failed: {}", e);
                continue;
            }
        };

        if mode == PlaybackMode::Serialize {
            if let Some(until) = busy_until {
                tokio::time::sleep_until(until).await;
            }
        }

        let duration = clip.duration();
        let (frames, sample_rate, channels) = (clip.frames(), clip.sample_rate, clip.channels);
        match sink.play(clip) {
            Ok(()) => {
                SessionStats::bump(&stats.clips_played);
                busy_until = Some(Instant::now() + duration);
                tracing::debug!(frames, sample_rate, channels, "Playing agent audio");
            }
            Err(e) => {
                tracing::error!("Output sink rejected clip: {}", e);
            }
        }
    }
}
