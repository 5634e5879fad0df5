//! # Voice Session
//!
//! Top-level state machine for one operator's conversation with the agent.
//!
//! ## Lifecycle:
//! 1. **Disconnected**: no connection, microphone released
//! 2. **Connecting**: microphone permission granted, opening the agent connection
//! 3. **Streaming**: capture running, inbound traffic dispatched
//! 4. **Closing**: transient, while resources are released
//!
//! Capture opens while the status is still Connecting and is the first thing
//! released once Closing is entered. In the settled states a capture stream
//! therefore exists exactly while the status is Streaming. Connecting is only
//! entered after microphone access was granted, so a permission refusal leaves
//! the status untouched.
//!
//! Only one connect attempt runs at a time. A connect issued while another is
//! still opening the connection returns `AlreadyActive` without waiting.
//!
//! ## Runtime:
//! All session work runs on the tokio runtime captured at construction. The public
//! async methods spawn onto it and await the result, so callers on other runtimes
//! (actix workers each run their own) can drive the session safely.

use crate::audio::buffer::{OutboundQueue, OverflowPolicy};
use crate::audio::capture::{AudioCaptureEncoder, CaptureStream};
use crate::audio::device::{AudioContext, CaptureConfig};
use crate::config::AppConfig;
use crate::voice::error::{VoiceError, VoiceResult};
use crate::voice::keepalive::KeepAliveResponder;
use crate::voice::player::{InboundAudioPlayer, PlaybackMode, PlayerHandle};
use crate::voice::protocol::InboundMessage;
use crate::voice::stats::{SessionStats, StatsSnapshot};
use crate::voice::transcript::{Speaker, TranscriptAggregator};
use crate::voice::transport::{self, CloseCallback, InboundHandler, TransportHandle};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Streaming,
    Closing,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Streaming => "streaming",
            SessionStatus::Closing => "closing",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectOutcome {
    Connected,
    /// A session was already live or being opened; nothing changed.
    AlreadyActive,
}

/// Settings a session is started with.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub url: String,
    pub connect_timeout: Duration,
    pub outbound_queue_capacity: usize,
    pub overflow_policy: OverflowPolicy,
    pub default_ping_delay: Duration,
    pub playback_mode: PlaybackMode,
    pub playback_queue_capacity: usize,
    pub capture: CaptureConfig,
}

impl SessionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            url: config.voice.url.clone(),
            connect_timeout: Duration::from_millis(config.voice.connect_timeout_ms),
            outbound_queue_capacity: config.voice.outbound_queue_capacity,
            overflow_policy: config.voice.overflow_policy,
            default_ping_delay: Duration::from_millis(config.voice.default_ping_delay_ms),
            playback_mode: config.voice.playback_mode,
            playback_queue_capacity: config.voice.playback_queue_capacity,
            capture: CaptureConfig {
                sample_rate: config.audio.sample_rate,
                frame_size: config.audio.frame_size,
            },
        }
    }
}

/// Summary for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub status: SessionStatus,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub url: String,
    /// Counters of the live session, or of the last one after it ended.
    pub stats: StatsSnapshot,
}

/// Routes parsed inbound messages to the session's components.
struct Dispatcher {
    keepalive: Arc<KeepAliveResponder>,
    player: PlayerHandle,
    transcript: Arc<TranscriptAggregator>,
    stats: Arc<SessionStats>,
}

impl InboundHandler for Dispatcher {
    fn on_message(&self, message: InboundMessage) {
        match message {
            InboundMessage::Ping { event_id, delay_ms } => {
                self.keepalive.schedule(event_id, delay_ms);
            }
            InboundMessage::Audio { audio_base64 } => {
                self.player.enqueue(audio_base64);
            }
            InboundMessage::AgentResponse { text } => {
                self.transcript.record(Speaker::Agent, text);
            }
            InboundMessage::UserTranscript { text } => {
                self.transcript.record(Speaker::User, text);
            }
            InboundMessage::Error { text } => {
                tracing::warn!(error = %text, "Agent reported an error");
                self.transcript.record(Speaker::Agent, text);
            }
            InboundMessage::Unknown { raw_type } => {
                SessionStats::bump(&self.stats.unknown_messages);
                tracing::debug!(%raw_type, "Ignoring unhandled message type");
            }
        }
    }
}

/// Resources owned by one Streaming period.
struct LiveSession {
    id: Uuid,
    capture: Option<CaptureStream>,
    keepalive: Arc<KeepAliveResponder>,
    player: InboundAudioPlayer,
    transport: TransportHandle,
}

struct CurrentSession {
    id: Option<Uuid>,
    started_at: Option<DateTime<Utc>>,
    stats: Arc<SessionStats>,
}

struct SessionInner {
    runtime: Handle,
    audio: Arc<AudioContext>,
    settings: RwLock<SessionSettings>,
    transcript: Arc<TranscriptAggregator>,
    status: watch::Sender<SessionStatus>,
    connecting: AtomicBool,
    live: tokio::sync::Mutex<Option<LiveSession>>,
    current: Mutex<CurrentSession>,
}

impl SessionInner {
    fn set_status(&self, status: SessionStatus) {
        let previous = self.status.send_replace(status);
        if previous != status {
            tracing::info!(from = previous.as_str(), to = status.as_str(), "Voice session status changed");
        }
    }

    fn settings(&self) -> SessionSettings {
        self.settings.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn current(&self) -> std::sync::MutexGuard<'_, CurrentSession> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Cloneable handle to the process's voice session.
#[derive(Clone)]
pub struct VoiceSession {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for VoiceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VoiceSession")
            .field("status", &self.status())
            .field("session_id", &self.session_id())
            .finish()
    }
}

impl VoiceSession {
    pub fn new(
        runtime: Handle,
        audio: Arc<AudioContext>,
        settings: SessionSettings,
        transcript: Arc<TranscriptAggregator>,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Disconnected);
        Self {
            inner: Arc::new(SessionInner {
                runtime,
                audio,
                settings: RwLock::new(settings),
                transcript,
                status,
                connecting: AtomicBool::new(false),
                live: tokio::sync::Mutex::new(None),
                current: Mutex::new(CurrentSession {
                    id: None,
                    started_at: None,
                    stats: Arc::new(SessionStats::default()),
                }),
            }),
        }
    }

    /// Start streaming. A no-op returning [`ConnectOutcome::AlreadyActive`] when a
    /// session is live or another connect attempt is still in progress.
    ///
    /// ## Errors:
    /// - `PermissionDenied`: microphone refused; status never left Disconnected
    /// - `ConnectionError`: agent unreachable; status back to Disconnected
    /// - `DeviceError`: capture could not start; connection closed again
    pub async fn connect(&self) -> VoiceResult<ConnectOutcome> {
        let inner = self.inner.clone();
        self.inner
            .runtime
            .spawn(connect_inner(inner))
            .await
            .map_err(|e| VoiceError::ConnectionError(format!("connect task failed: {}", e)))?
    }

    /// Stop streaming and release every resource. Returns whether a session was
    /// live; calling it again is harmless.
    pub async fn disconnect(&self) -> bool {
        let inner = self.inner.clone();
        match self.inner.runtime.spawn(disconnect_inner(inner)).await {
            Ok(was_live) => was_live,
            Err(e) => {
                tracing::error!("Disconnect task failed: {}", e);
                false
            }
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.inner.current().id
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.current().stats.snapshot()
    }

    pub fn transcript(&self) -> &Arc<TranscriptAggregator> {
        &self.inner.transcript
    }

    pub fn info(&self) -> SessionInfo {
        let current = self.inner.current();
        SessionInfo {
            status: self.status(),
            session_id: current.id,
            started_at: current.started_at,
            url: self.url(),
            stats: current.stats.snapshot(),
        }
    }

    pub fn url(&self) -> String {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .url
            .clone()
    }

    /// Replace the settings used by the next connect.
    pub fn update_settings(&self, settings: SessionSettings) {
        *self.inner.settings.write().unwrap_or_else(|e| e.into_inner()) = settings;
    }
}

/// Marks a connect attempt in flight; released on every exit path.
struct ConnectClaim<'a>(&'a AtomicBool);

impl<'a> ConnectClaim<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ConnectClaim(flag))
    }
}

impl Drop for ConnectClaim<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn connect_inner(inner: Arc<SessionInner>) -> VoiceResult<ConnectOutcome> {
    // A second caller must not queue behind a pending handshake and then open
    // its own connection once that one fails.
    let Some(_claim) = ConnectClaim::acquire(&inner.connecting) else {
        tracing::debug!("Connect ignored, another attempt is in progress");
        return Ok(ConnectOutcome::AlreadyActive);
    };

    let mut live = inner.live.lock().await;
    if let Some(session) = live.as_ref() {
        tracing::debug!(session_id = %session.id, "Connect ignored, session already active");
        return Ok(ConnectOutcome::AlreadyActive);
    }

    let settings = inner.settings();
    let device = inner.audio.device().clone();
    if let Err(e) = device.request_input_access() {
        tracing::warn!(device = device.name(), "Microphone access refused: {}", e);
        return Err(e);
    }

    inner.set_status(SessionStatus::Connecting);
    let connected = match transport::open(&settings.url, settings.connect_timeout).await {
        Ok(connected) => connected,
        Err(e) => {
            tracing::error!(url = %settings.url, "Voice connection failed: {}", e);
            inner.set_status(SessionStatus::Disconnected);
            return Err(e);
        }
    };

    let sink = match inner.audio.output() {
        Ok(sink) => sink,
        Err(e) => {
            tracing::error!("Audio output unavailable: {}", e);
            inner.set_status(SessionStatus::Disconnected);
            return Err(e);
        }
    };

    let id = Uuid::new_v4();
    let stats = Arc::new(SessionStats::default());
    let keepalive = Arc::new(KeepAliveResponder::new(
        connected.control(),
        settings.default_ping_delay,
        stats.clone(),
    ));
    let player = InboundAudioPlayer::start(
        sink,
        settings.playback_mode,
        settings.playback_queue_capacity,
        stats.clone(),
    );
    let dispatcher = Arc::new(Dispatcher {
        keepalive: keepalive.clone(),
        player: player.handle(),
        transcript: inner.transcript.clone(),
        stats: stats.clone(),
    });
    let queue = Arc::new(OutboundQueue::new(
        settings.outbound_queue_capacity,
        settings.overflow_policy,
        stats.clone(),
    ));

    let weak = Arc::downgrade(&inner);
    let on_closed: CloseCallback = Box::new(move |reason| {
        if let Some(inner) = weak.upgrade() {
            let runtime = inner.runtime.clone();
            runtime.spawn(on_transport_lost(inner, id, reason));
        }
    });
    let mut transport = connected.start(queue.clone(), dispatcher, on_closed, stats.clone());

    let encoder = AudioCaptureEncoder::new(
        settings.capture.frame_size,
        settings.capture.sample_rate,
        queue,
        stats.clone(),
    );
    let capture = match CaptureStream::start(device.as_ref(), &settings.capture, encoder) {
        Ok(capture) => capture,
        Err(e) => {
            tracing::error!("Microphone capture failed to start: {}", e);
            keepalive.cancel_all();
            player.stop();
            transport.close().await;
            inner.audio.release_output();
            inner.set_status(SessionStatus::Disconnected);
            return Err(e);
        }
    };

    *live = Some(LiveSession {
        id,
        capture: Some(capture),
        keepalive,
        player,
        transport,
    });
    {
        let mut current = inner.current();
        current.id = Some(id);
        current.started_at = Some(Utc::now());
        current.stats = stats;
    }
    inner.set_status(SessionStatus::Streaming);
    tracing::info!(session_id = %id, url = %settings.url, "Voice session streaming");

    Ok(ConnectOutcome::Connected)
}

async fn disconnect_inner(inner: Arc<SessionInner>) -> bool {
    let mut live = inner.live.lock().await;
    match live.take() {
        Some(session) => {
            let id = session.id;
            teardown(&inner, session).await;
            tracing::info!(session_id = %id, "Voice session disconnected");
            true
        }
        None => false,
    }
}

async fn on_transport_lost(inner: Arc<SessionInner>, id: Uuid, reason: String) {
    let mut live = inner.live.lock().await;
    if live.as_ref().map(|s| s.id) != Some(id) {
        tracing::debug!(session_id = %id, "Ignoring close of a session that already ended");
        return;
    }

    if let Some(session) = live.take() {
        teardown(&inner, session).await;
    }
    inner
        .transcript
        .record(Speaker::Agent, format!("Voice connection lost: {}", reason));
    tracing::warn!(session_id = %id, %reason, "Voice session ended by transport");
}

/// Release order: microphone, timers, player, connection, speaker.
async fn teardown(inner: &SessionInner, mut session: LiveSession) {
    inner.set_status(SessionStatus::Closing);

    drop(session.capture.take());
    session.keepalive.cancel_all();
    session.player.stop();
    session.transport.close().await;
    inner.audio.release_output();

    {
        let mut current = inner.current();
        current.id = None;
        current.started_at = None;
    }
    inner.set_status(SessionStatus::Disconnected);
}
