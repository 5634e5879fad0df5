//! # Audio Device Abstraction
//!
//! The platform seam for microphone capture and speaker playback. A session never
//! talks to a sound card directly; it goes through an [`AudioContext`] that owns one
//! [`AudioDevice`] and lazily opens a single shared output sink.
//!
//! ## Backends:
//! - **cpal** (feature `cpal`): real default input/output devices
//! - **null**: no microphone (connect fails with a permission error), playback discarded
//!
//! ## Lifetime:
//! The context is created once at startup and handed to the voice session. The output
//! sink is opened on first playback and released when the session ends, so idle
//! processes hold no audio hardware.

use crate::audio::decoder::DecodedAudio;
use crate::voice::error::{VoiceError, VoiceResult};
use std::sync::{Arc, Mutex};

/// Callback invoked from the capture thread with each device buffer of mono samples.
/// Buffer length is whatever the device delivers.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send + 'static>;

/// Requested capture parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Preferred sample rate; backends may fall back to the device default.
    pub sample_rate: u32,
    /// Samples per outbound frame.
    pub frame_size: usize,
}

/// Handle to an open capture stream. Dropping it stops capture and releases the
/// microphone.
pub trait InputStream: Send {
    /// Rate the device is actually delivering.
    fn sample_rate(&self) -> u32;
}

/// Destination for decoded agent audio.
pub trait OutputSink: Send + Sync {
    /// Start playing `clip` now. Returns as soon as the clip is handed off; playback
    /// continues in the background and may overlap clips already playing.
    fn play(&self, clip: DecodedAudio) -> VoiceResult<()>;
}

pub trait AudioDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Check that the microphone may be used. Called before any network activity.
    fn request_input_access(&self) -> VoiceResult<()>;

    /// Open the microphone and deliver buffers to `on_samples` until the returned
    /// stream is dropped.
    fn open_input(
        &self,
        config: &CaptureConfig,
        on_samples: FrameCallback,
    ) -> VoiceResult<Box<dyn InputStream>>;

    fn open_output(&self) -> VoiceResult<Arc<dyn OutputSink>>;
}

/// Explicitly owned audio context shared by every session in the process.
pub struct AudioContext {
    device: Arc<dyn AudioDevice>,
    output: Mutex<Option<Arc<dyn OutputSink>>>,
}

impl AudioContext {
    pub fn new(device: Arc<dyn AudioDevice>) -> Self {
        Self {
            device,
            output: Mutex::new(None),
        }
    }

    pub fn device(&self) -> &Arc<dyn AudioDevice> {
        &self.device
    }

    /// Shared output sink, opened on first use.
    pub fn output(&self) -> VoiceResult<Arc<dyn OutputSink>> {
        let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(sink) = output.as_ref() {
            return Ok(sink.clone());
        }

        let sink = self.device.open_output()?;
        tracing::debug!(device = self.device.name(), "Opened audio output");
        *output = Some(sink.clone());
        Ok(sink)
    }

    /// Close the output sink. Returns whether one was open.
    pub fn release_output(&self) -> bool {
        let released = self
            .output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .is_some();
        if released {
            tracing::debug!(device = self.device.name(), "Released audio output");
        }
        released
    }

    #[cfg(test)]
    pub fn has_output(&self) -> bool {
        self.output.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

/// Device used when the binary is built without an audio backend.
#[derive(Debug, Default)]
pub struct NullAudioDevice;

struct NullSink;

impl OutputSink for NullSink {
    fn play(&self, clip: DecodedAudio) -> VoiceResult<()> {
        tracing::debug!(
            frames = clip.frames(),
            sample_rate = clip.sample_rate,
            "No audio backend, discarding agent audio"
        );
        Ok(())
    }
}

impl AudioDevice for NullAudioDevice {
    fn name(&self) -> &str {
        "null"
    }

    fn request_input_access(&self) -> VoiceResult<()> {
        Err(VoiceError::PermissionDenied(
            "no microphone backend available (build with --features cpal)".to_string(),
        ))
    }

    fn open_input(
        &self,
        _config: &CaptureConfig,
        _on_samples: FrameCallback,
    ) -> VoiceResult<Box<dyn InputStream>> {
        Err(VoiceError::DeviceError("null device has no input".to_string()))
    }

    fn open_output(&self) -> VoiceResult<Arc<dyn OutputSink>> {
        Ok(Arc::new(NullSink))
    }
}
