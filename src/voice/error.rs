//! # Voice Session Errors
//!
//! Only `PermissionDenied` and `ConnectionError` end a session. Protocol and decode
//! failures are absorbed where they happen (logged and counted) so that a single bad
//! frame cannot end the conversation.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VoiceError {
    /// Microphone access was refused. Connect aborts before the transport is opened.
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    /// The voice stream failed to open or closed underneath a live session.
    #[error("voice connection error: {0}")]
    ConnectionError(String),

    /// Inbound frame was not valid JSON or lacked a required field.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Agent audio payload could not be turned into playable samples.
    #[error("audio decode error: {0}")]
    DecodeError(String),

    /// Audio device failure other than a permission refusal.
    #[error("audio device error: {0}")]
    DeviceError(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for VoiceError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        VoiceError::ConnectionError(err.to_string())
    }
}

pub type VoiceResult<T> = Result<T, VoiceError>;
