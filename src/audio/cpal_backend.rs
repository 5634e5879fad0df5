//! # cpal Audio Backend
//!
//! Default input and output devices of the host audio system.
//!
//! cpal streams are not `Send` on every platform, so each stream lives on its own
//! thread. The thread builds the stream, reports back through a rendezvous channel,
//! then parks until its stop channel disconnects. Dropping the handle drops the
//! sender and the thread tears the stream down.
//!
//! Output is a small mixer: every clip handed to [`OutputSink::play`] becomes a
//! voice that is summed into the device buffer, resampled linearly to the device
//! rate. Clips therefore overlap when they arrive faster than they play.

use crate::audio::decoder::DecodedAudio;
use crate::audio::device::{AudioDevice, CaptureConfig, FrameCallback, InputStream, OutputSink};
use crate::voice::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, StreamConfig, SupportedStreamConfig};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

pub struct CpalAudioDevice {
    name: String,
}

impl CpalAudioDevice {
    pub fn new() -> Self {
        let host = cpal::default_host();
        Self {
            name: format!("cpal/{}", host.id().name()),
        }
    }
}

impl Default for CpalAudioDevice {
    fn default() -> Self {
        Self::new()
    }
}

fn input_config(device: &cpal::Device, preferred_rate: u32) -> VoiceResult<SupportedStreamConfig> {
    let preferred = device.supported_input_configs().ok().and_then(|mut configs| {
        configs.find_map(|range| {
            let fits = range.min_sample_rate().0 <= preferred_rate
                && preferred_rate <= range.max_sample_rate().0;
            let usable = matches!(range.sample_format(), SampleFormat::F32 | SampleFormat::I16);
            (fits && usable).then(|| range.with_sample_rate(SampleRate(preferred_rate)))
        })
    });

    match preferred {
        Some(config) => Ok(config),
        None => device
            .default_input_config()
            .map_err(|e| VoiceError::DeviceError(format!("no usable input config: {}", e))),
    }
}

struct CpalInputStream {
    sample_rate: u32,
    _stop: mpsc::Sender<()>,
}

impl InputStream for CpalInputStream {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

fn build_input(
    device: &cpal::Device,
    supported: SupportedStreamConfig,
    mut on_samples: FrameCallback,
) -> VoiceResult<cpal::Stream> {
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let channels = config.channels.max(1) as usize;
    let on_error = |e: cpal::StreamError| tracing::error!("Microphone stream error: {}", e);

    let mut mono: Vec<f32> = Vec::new();
    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.iter().step_by(channels).copied());
                on_samples(&mono);
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                mono.clear();
                mono.extend(data.iter().step_by(channels).map(|&s| s as f32 / 32768.0));
                on_samples(&mono);
            },
            on_error,
            None,
        ),
        other => {
            return Err(VoiceError::DeviceError(format!(
                "unsupported input sample format {:?}",
                other
            )))
        }
    };

    stream.map_err(|e| VoiceError::DeviceError(format!("failed to open microphone: {}", e)))
}

/// A clip being played, positioned in source frames.
struct Voice {
    clip: DecodedAudio,
    position: f64,
    step: f64,
}

impl Voice {
    fn sample(&self, channel: usize) -> f32 {
        let channels = self.clip.channels.max(1) as usize;
        let channel = channel.min(channels - 1);
        let frame = self.position.floor() as usize;
        let frac = (self.position - frame as f64) as f32;

        let at = |f: usize| {
            self.clip
                .samples
                .get(f * channels + channel)
                .copied()
                .unwrap_or(0.0)
        };
        at(frame) * (1.0 - frac) + at(frame + 1) * frac
    }

    fn finished(&self) -> bool {
        self.position >= self.clip.frames() as f64
    }
}

type Mixer = Arc<Mutex<Vec<Voice>>>;

fn mix_into(mixer: &Mixer, out: &mut [f32], channels: usize) {
    let mut voices = mixer.lock().unwrap_or_else(|e| e.into_inner());
    for frame in out.chunks_mut(channels) {
        for (channel, slot) in frame.iter_mut().enumerate() {
            let sum: f32 = voices.iter().map(|v| v.sample(channel)).sum();
            *slot = sum.clamp(-1.0, 1.0);
        }
        for voice in voices.iter_mut() {
            voice.position += voice.step;
        }
    }
    voices.retain(|v| !v.finished());
}

struct CpalOutputSink {
    mixer: Mixer,
    sample_rate: u32,
    _stop: mpsc::Sender<()>,
}

impl OutputSink for CpalOutputSink {
    fn play(&self, clip: DecodedAudio) -> VoiceResult<()> {
        if clip.sample_rate == 0 || clip.channels == 0 {
            return Err(VoiceError::DecodeError("clip has no format".to_string()));
        }
        let step = clip.sample_rate as f64 / self.sample_rate as f64;
        self.mixer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Voice {
                clip,
                position: 0.0,
                step,
            });
        Ok(())
    }
}

fn build_output(device: &cpal::Device, mixer: Mixer) -> VoiceResult<(cpal::Stream, u32)> {
    let supported = device
        .default_output_config()
        .map_err(|e| VoiceError::DeviceError(format!("no usable output config: {}", e)))?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let channels = config.channels.max(1) as usize;
    let sample_rate = config.sample_rate.0;
    let on_error = |e: cpal::StreamError| tracing::error!("Speaker stream error: {}", e);

    let stream = match format {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                mix_into(&mixer, data, channels);
            },
            on_error,
            None,
        ),
        SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    mix_into(&mixer, &mut scratch, channels);
                    for (out, s) in data.iter_mut().zip(scratch.iter()) {
                        *out = crate::audio::capture::sample_to_pcm16(*s);
                    }
                },
                on_error,
                None,
            )
        }
        other => {
            return Err(VoiceError::DeviceError(format!(
                "unsupported output sample format {:?}",
                other
            )))
        }
    };

    let stream =
        stream.map_err(|e| VoiceError::DeviceError(format!("failed to open speaker: {}", e)))?;
    Ok((stream, sample_rate))
}

/// Run `build` on a dedicated thread that keeps the resulting stream alive until the
/// returned sender is dropped.
fn spawn_stream_thread<F>(label: &'static str, build: F) -> VoiceResult<(u32, mpsc::Sender<()>)>
where
    F: FnOnce() -> VoiceResult<(cpal::Stream, u32)> + Send + 'static,
{
    let (ready_tx, ready_rx) = mpsc::sync_channel::<VoiceResult<u32>>(1);
    let (stop_tx, stop_rx) = mpsc::channel::<()>();

    thread::Builder::new()
        .name(format!("audio-{}", label))
        .spawn(move || {
            let stream = match build() {
                Ok((stream, rate)) => match stream.play() {
                    Ok(()) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::DeviceError(e.to_string())));
                        return;
                    }
                },
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            // Blocks until the owning handle drops its sender.
            let _ = stop_rx.recv();
            drop(stream);
        })
        .map_err(|e| VoiceError::DeviceError(format!("failed to spawn {} thread: {}", label, e)))?;

    let rate = ready_rx
        .recv()
        .map_err(|_| VoiceError::DeviceError(format!("{} thread exited during setup", label)))??;
    Ok((rate, stop_tx))
}

impl AudioDevice for CpalAudioDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_input_access(&self) -> VoiceResult<()> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| VoiceError::PermissionDenied("no microphone available".to_string()))?;
        device
            .default_input_config()
            .map_err(|e| VoiceError::PermissionDenied(format!("microphone unavailable: {}", e)))?;
        Ok(())
    }

    fn open_input(
        &self,
        config: &CaptureConfig,
        on_samples: FrameCallback,
    ) -> VoiceResult<Box<dyn InputStream>> {
        let preferred_rate = config.sample_rate;
        let (sample_rate, stop) = spawn_stream_thread("input", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| VoiceError::PermissionDenied("no microphone available".to_string()))?;
            let supported = input_config(&device, preferred_rate)?;
            let rate = supported.sample_rate().0;
            let stream = build_input(&device, supported, on_samples)?;
            Ok((stream, rate))
        })?;

        Ok(Box::new(CpalInputStream {
            sample_rate,
            _stop: stop,
        }))
    }

    fn open_output(&self) -> VoiceResult<Arc<dyn OutputSink>> {
        let mixer: Mixer = Arc::new(Mutex::new(Vec::new()));
        let thread_mixer = mixer.clone();
        let (sample_rate, stop) = spawn_stream_thread("output", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| VoiceError::DeviceError("no speaker available".to_string()))?;
            build_output(&device, thread_mixer)
        })?;

        Ok(Arc::new(CpalOutputSink {
            mixer,
            sample_rate,
            _stop: stop,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clip(samples: Vec<f32>, sample_rate: u32, channels: u16) -> DecodedAudio {
        DecodedAudio {
            samples,
            sample_rate,
            channels,
        }
    }

    #[test]
    fn test_mixer_sums_overlapping_voices() {
        let mixer: Mixer = Arc::new(Mutex::new(vec![
            Voice { clip: clip(vec![0.25; 4], 8000, 1), position: 0.0, step: 1.0 },
            Voice { clip: clip(vec![0.5; 2], 8000, 1), position: 0.0, step: 1.0 },
        ]));

        let mut out = vec![0.0f32; 8];
        mix_into(&mixer, &mut out, 2);

        assert_eq!(out, vec![0.75, 0.75, 0.75, 0.75, 0.25, 0.25, 0.25, 0.25]);
        assert!(mixer.lock().unwrap().is_empty());
    }

    #[test]
    fn test_voice_resamples_linearly() {
        let voice = Voice { clip: clip(vec![0.0, 1.0], 8000, 1), position: 0.5, step: 0.5 };
        assert!((voice.sample(0) - 0.5).abs() < 1e-6);
    }
}
