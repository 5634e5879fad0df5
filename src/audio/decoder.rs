//! # Agent Audio Decoding
//!
//! Turns the container bytes carried in an `audio` frame (MP3 or WAV) into
//! interleaved `f32` samples via symphonia. Runs on the blocking pool; callers
//! should not invoke it on an async worker.

use crate::voice::error::{VoiceError, VoiceResult};
use std::io::Cursor;
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// A fully decoded clip ready for an output sink.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    /// Interleaved samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    /// Number of sample frames (samples per channel).
    pub fn frames(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }
}

/// Decode a complete audio container. The format is sniffed from the bytes.
pub fn decode_clip(bytes: Vec<u8>) -> VoiceResult<DecodedAudio> {
    if bytes.is_empty() {
        return Err(VoiceError::DecodeError("empty audio payload".to_string()));
    }

    let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| VoiceError::DecodeError(format!("unrecognized audio container: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| VoiceError::DecodeError("no audio track".to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| VoiceError::DecodeError(format!("unsupported codec: {}", e)))?;

    let mut samples: Vec<f32> = Vec::new();
    let mut sample_rate = codec_params.sample_rate.unwrap_or(0);
    let mut channels = codec_params.channels.map(|c| c.count() as u16).unwrap_or(0);

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => {
                return Err(VoiceError::DecodeError(format!("packet read failed: {}", e)));
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("Skipping corrupt audio packet: {}", e);
                continue;
            }
            Err(e) => return Err(VoiceError::DecodeError(e.to_string())),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    if samples.is_empty() || sample_rate == 0 || channels == 0 {
        return Err(VoiceError::DecodeError("clip contained no samples".to_string()));
    }

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal 16-bit PCM WAV file.
    pub(crate) fn wav_bytes(samples: &[i16], sample_rate: u32, channels: u16) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let block_align = channels * 2;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&(sample_rate * block_align as u32).to_le_bytes());
        out.extend_from_slice(&block_align.to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    #[test]
    fn test_decode_wav() {
        let pcm: Vec<i16> = (0..1600).map(|i| if i % 2 == 0 { 16384 } else { -16384 }).collect();
        let clip = decode_clip(wav_bytes(&pcm, 16000, 1)).unwrap();

        assert_eq!(clip.sample_rate, 16000);
        assert_eq!(clip.channels, 1);
        assert_eq!(clip.frames(), 1600);
        assert_eq!(clip.duration(), Duration::from_millis(100));
        assert!((clip.samples[0] - 0.5).abs() < 1e-3);
        assert!((clip.samples[1] + 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_decode_stereo_is_interleaved() {
        let pcm = vec![100i16; 800];
        let clip = decode_clip(wav_bytes(&pcm, 8000, 2)).unwrap();
        assert_eq!(clip.channels, 2);
        assert_eq!(clip.frames(), 400);
        assert_eq!(clip.duration(), Duration::from_millis(50));
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let result = decode_clip(b"definitely not audio, just some bytes".to_vec());
        assert!(matches!(result, Err(VoiceError::DecodeError(_))));
        assert!(matches!(decode_clip(Vec::new()), Err(VoiceError::DecodeError(_))));
    }
}
