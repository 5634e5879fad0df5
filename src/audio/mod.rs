//! # Audio Module
//!
//! Everything that touches samples: microphone capture and wire encoding, the
//! bounded outbound queue, agent clip decoding, and the device seam.
//!
//! ## Formats:
//! - **Outbound**: mono PCM16LE, base64, fixed frames (default 4096 samples)
//! - **Inbound**: MP3 or WAV containers, decoded to interleaved `f32`

pub mod buffer;       // Bounded capture → transport queue
pub mod capture;      // Framing and PCM16 encoding
pub mod decoder;      // symphonia clip decoding
pub mod device;       // AudioDevice / AudioContext seam

#[cfg(feature = "cpal")]
pub mod cpal_backend;

pub use device::{AudioContext, AudioDevice, NullAudioDevice};
