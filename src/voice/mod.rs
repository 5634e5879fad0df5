//! # Voice Module
//!
//! Real-time duplex conversation with the planning agent over a WebSocket.
//!
//! ## Components:
//! - **protocol**: typed inbound/outbound frames
//! - **transport**: connection ownership, writer and reader tasks
//! - **keepalive**: delayed pong replies to pings
//! - **player**: agent audio decode and playback
//! - **transcript**: ordered conversation log
//! - **session**: connect/disconnect state machine tying it all together

pub mod error;
pub mod keepalive;
pub mod player;
pub mod protocol;
pub mod session;
pub mod stats;
pub mod transcript;
pub mod transport;

pub use error::VoiceError;
pub use session::{SessionInfo, SessionSettings, SessionStatus, VoiceSession};
pub use stats::StatsSnapshot;
pub use transcript::{Speaker, TranscriptAggregator, TranscriptEntry};
