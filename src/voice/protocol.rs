//! # Voice Stream Wire Protocol
//!
//! JSON text frames exchanged with the agent at `/voice-stream`.
//!
//! ## Outbound (client → agent)
//! - `{"user_audio_chunk": "<base64 PCM16LE mono>"}`: one per captured frame
//! - `{"type": "pong", "event_id": <id>}`: one per ping, after the requested delay
//!
//! ## Inbound (agent → client), discriminated by `"type"`
//! - `ping` with `ping_event: {event_id, ping_ms}`
//! - `audio` with `audio_event: {audio_base64}`
//! - `agent_response` with `agent_response_event: {agent_response}`
//! - `user_transcript` with `user_transcription_event: {user_transcript}`
//! - `error` with `error: <string>`
//!
//! Anything else parses to [`InboundMessage::Unknown`] (unrecognized type) or fails with
//! [`VoiceError::ProtocolError`] (not JSON, no discriminant, missing payload).

use crate::voice::error::VoiceError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Ping identifier, echoed back verbatim in the pong (the agent may use numbers or strings).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Value);

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        EventId(Value::String(id.to_string()))
    }
}

impl From<u64> for EventId {
    fn from(id: u64) -> Self {
        EventId(Value::from(id))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

/// A parsed inbound frame. Built once per received frame and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Liveness probe. `delay_ms` is `None` when the agent did not specify one.
    Ping { event_id: EventId, delay_ms: Option<u64> },
    /// Base64-encoded audio container (MP3/WAV) to play.
    Audio { audio_base64: String },
    AgentResponse { text: String },
    UserTranscript { text: String },
    Error { text: String },
    /// Well-formed frame with a discriminant this client does not handle.
    Unknown { raw_type: String },
}

impl InboundMessage {
    pub fn kind(&self) -> &str {
        match self {
            InboundMessage::Ping { .. } => "ping",
            InboundMessage::Audio { .. } => "audio",
            InboundMessage::AgentResponse { .. } => "agent_response",
            InboundMessage::UserTranscript { .. } => "user_transcript",
            InboundMessage::Error { .. } => "error",
            InboundMessage::Unknown { raw_type } => raw_type,
        }
    }
}

#[derive(Deserialize)]
struct PingFrame {
    ping_event: PingEvent,
}

#[derive(Deserialize)]
struct PingEvent {
    event_id: EventId,
    #[serde(default)]
    ping_ms: Option<f64>,
}

#[derive(Deserialize)]
struct AudioFrame {
    audio_event: AudioEvent,
}

#[derive(Deserialize)]
struct AudioEvent {
    audio_base64: String,
}

#[derive(Deserialize)]
struct AgentResponseFrame {
    agent_response_event: AgentResponseEvent,
}

#[derive(Deserialize)]
struct AgentResponseEvent {
    agent_response: String,
}

#[derive(Deserialize)]
struct UserTranscriptFrame {
    user_transcription_event: UserTranscriptionEvent,
}

#[derive(Deserialize)]
struct UserTranscriptionEvent {
    user_transcript: String,
}

#[derive(Deserialize)]
struct ErrorFrame {
    error: String,
}

/// Parse one raw text frame into an [`InboundMessage`].
pub fn parse_inbound(raw: &str) -> Result<InboundMessage, VoiceError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| VoiceError::ProtocolError(format!("invalid JSON: {}", e)))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| VoiceError::ProtocolError("missing \"type\" discriminant".to_string()))?
        .to_string();

    match kind.as_str() {
        "ping" => {
            let frame: PingFrame = payload(&kind, value)?;
            if frame.ping_event.event_id.0.is_null() {
                return Err(VoiceError::ProtocolError("ping without event_id".to_string()));
            }
            Ok(InboundMessage::Ping {
                event_id: frame.ping_event.event_id,
                delay_ms: frame.ping_event.ping_ms.map(delay_from_ms),
            })
        }
        "audio" => {
            let frame: AudioFrame = payload(&kind, value)?;
            let audio_base64 = non_empty(&kind, frame.audio_event.audio_base64)?;
            Ok(InboundMessage::Audio { audio_base64 })
        }
        "agent_response" => {
            let frame: AgentResponseFrame = payload(&kind, value)?;
            let text = non_empty(&kind, frame.agent_response_event.agent_response)?;
            Ok(InboundMessage::AgentResponse { text })
        }
        "user_transcript" => {
            let frame: UserTranscriptFrame = payload(&kind, value)?;
            let text = non_empty(&kind, frame.user_transcription_event.user_transcript)?;
            Ok(InboundMessage::UserTranscript { text })
        }
        "error" => {
            let frame: ErrorFrame = payload(&kind, value)?;
            let text = non_empty(&kind, frame.error)?;
            Ok(InboundMessage::Error { text })
        }
        _ => Ok(InboundMessage::Unknown { raw_type: kind }),
    }
}

fn payload<T: DeserializeOwned>(kind: &str, value: Value) -> Result<T, VoiceError> {
    serde_json::from_value(value)
        .map_err(|e| VoiceError::ProtocolError(format!("malformed {} frame: {}", kind, e)))
}

fn non_empty(kind: &str, text: String) -> Result<String, VoiceError> {
    if text.is_empty() {
        Err(VoiceError::ProtocolError(format!("empty {} payload", kind)))
    } else {
        Ok(text)
    }
}

// Negative and non-finite delays answer immediately.
fn delay_from_ms(ms: f64) -> u64 {
    if ms.is_finite() && ms > 0.0 {
        ms.round() as u64
    } else {
        0
    }
}

/// Frames this client sends to the agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    AudioChunk {
        user_audio_chunk: String,
    },
    Pong {
        #[serde(rename = "type")]
        kind: &'static str,
        event_id: EventId,
    },
}

impl OutboundMessage {
    pub fn pong(event_id: EventId) -> Self {
        OutboundMessage::Pong { kind: "pong", event_id }
    }

    pub fn audio_chunk(payload: impl Into<String>) -> Self {
        OutboundMessage::AudioChunk {
            user_audio_chunk: payload.into(),
        }
    }

    pub fn to_text(&self) -> Result<String, VoiceError> {
        serde_json::to_string(self)
            .map_err(|e| VoiceError::ProtocolError(format!("failed to encode frame: {}", e)))
    }
}
