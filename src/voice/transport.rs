//! # Session Transport
//!
//! Owns the WebSocket to the agent. After [`open`] succeeds, [`Connected::start`]
//! splits the socket into two tasks:
//!
//! - **writer**: drains the pong control channel first, then the outbound audio
//!   queue, one JSON text frame per message
//! - **reader**: parses every inbound text frame and hands it to the
//!   [`InboundHandler`] in arrival order; malformed frames are counted and dropped
//!
//! ## Closure:
//! The `on_closed` callback fires exactly once when the connection dies underneath
//! the session (peer close, read or write error). A close requested through
//! [`TransportHandle::close`] never fires it.

use crate::audio::buffer::OutboundQueue;
use crate::voice::error::{VoiceError, VoiceResult};
use crate::voice::protocol::{parse_inbound, InboundMessage, OutboundMessage};
use crate::voice::stats::SessionStats;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pongs are tiny and rare; a few slots are plenty.
const CONTROL_CAPACITY: usize = 16;
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Receives inbound traffic on the reader task. Implementations must not block.
pub trait InboundHandler: Send + Sync {
    fn on_message(&self, message: InboundMessage);

    fn on_protocol_error(&self, error: VoiceError, raw: &str) {
        let preview: String = raw.chars().take(120).collect();
        tracing::warn!(frame = %preview, "Dropping inbound frame: {}", error);
    }
}

pub type CloseCallback = Box<dyn FnOnce(String) + Send + 'static>;

/// Fires the close callback at most once, unless suppressed by a local close.
struct CloseNotifier {
    callback: Mutex<Option<CloseCallback>>,
    suppressed: AtomicBool,
}

impl CloseNotifier {
    fn new(callback: CloseCallback) -> Self {
        Self {
            callback: Mutex::new(Some(callback)),
            suppressed: AtomicBool::new(false),
        }
    }

    fn fire(&self, reason: String) {
        if self.suppressed.load(Ordering::Acquire) {
            return;
        }
        let callback = self.callback.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(callback) = callback {
            tracing::warn!(%reason, "Voice connection lost");
            callback(reason);
        }
    }

    fn suppress(&self) {
        self.suppressed.store(true, Ordering::Release);
        self.callback.lock().unwrap_or_else(|e| e.into_inner()).take();
    }
}

/// Open the agent connection, bounded by `timeout`.
pub async fn open(url: &str, timeout: Duration) -> VoiceResult<Connected> {
    tracing::info!(%url, "Opening voice connection");
    let (ws, response) = tokio::time::timeout(timeout, connect_async(url))
        .await
        .map_err(|_| {
            VoiceError::ConnectionError(format!(
                "timed out after {}ms connecting to {}",
                timeout.as_millis(),
                url
            ))
        })??;
    tracing::debug!(status = %response.status(), "Voice connection established");

    let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
    Ok(Connected {
        ws,
        control_tx,
        control_rx,
    })
}

/// An open connection whose I/O tasks have not started yet.
pub struct Connected {
    ws: WsStream,
    control_tx: mpsc::Sender<OutboundMessage>,
    control_rx: mpsc::Receiver<OutboundMessage>,
}

impl Connected {
    /// Weak sender for control frames. Upgrading fails once the transport is closed.
    pub fn control(&self) -> mpsc::WeakSender<OutboundMessage> {
        self.control_tx.downgrade()
    }

    pub fn start(
        self,
        outbound: Arc<OutboundQueue>,
        handler: Arc<dyn InboundHandler>,
        on_closed: CloseCallback,
        stats: Arc<SessionStats>,
    ) -> TransportHandle {
        let Connected {
            ws,
            control_tx,
            control_rx,
        } = self;
        let (sink, stream) = ws.split();
        let notifier = Arc::new(CloseNotifier::new(on_closed));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let writer = tokio::spawn(run_writer(
            sink,
            control_rx,
            outbound.clone(),
            shutdown_rx,
            notifier.clone(),
            stats.clone(),
        ));
        let reader = tokio::spawn(run_reader(stream, handler, notifier.clone(), stats));

        TransportHandle {
            shutdown: Some(shutdown_tx),
            writer: Some(writer),
            reader: Some(reader),
            control: Some(control_tx),
            outbound,
            notifier,
        }
    }
}

async fn send_frame(
    sink: &mut SplitSink<WsStream, Message>,
    message: &OutboundMessage,
) -> Result<(), String> {
    let text = message.to_text().map_err(|e| e.to_string())?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| format!("write failed: {}", e))
}

async fn run_writer(
    mut sink: SplitSink<WsStream, Message>,
    mut control: mpsc::Receiver<OutboundMessage>,
    outbound: Arc<OutboundQueue>,
    mut shutdown: oneshot::Receiver<()>,
    notifier: Arc<CloseNotifier>,
    stats: Arc<SessionStats>,
) {
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => break,

            Some(message) = control.recv() => {
                if let Err(reason) = send_frame(&mut sink, &message).await {
                    notifier.fire(reason);
                    return;
                }
                SessionStats::bump(&stats.pongs_sent);
            }

            chunk = outbound.pop() => {
                let Some(chunk) = chunk else { break };
                let sequence = chunk.sequence;
                if let Err(reason) = send_frame(&mut sink, &chunk.into_message()).await {
                    notifier.fire(reason);
                    return;
                }
                SessionStats::bump(&stats.chunks_sent);
                tracing::trace!(sequence, "Audio chunk sent");
            }
        }
    }

    if let Err(e) = sink.send(Message::Close(None)).await {
        tracing::debug!("Close frame not delivered: {}", e);
    }
    let _ = sink.close().await;
}

async fn run_reader(
    mut stream: SplitStream<WsStream>,
    handler: Arc<dyn InboundHandler>,
    notifier: Arc<CloseNotifier>,
    stats: Arc<SessionStats>,
) {
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match parse_inbound(&text) {
                Ok(message) => handler.on_message(message),
                Err(e) => {
                    SessionStats::bump(&stats.protocol_errors);
                    handler.on_protocol_error(e, &text);
                }
            },
            Ok(Message::Binary(bytes)) => {
                SessionStats::bump(&stats.protocol_errors);
                handler.on_protocol_error(
                    VoiceError::ProtocolError(format!("unexpected binary frame ({} bytes)", bytes.len())),
                    "",
                );
            }
            Ok(Message::Close(frame)) => {
                let reason = match frame {
                    Some(frame) if !frame.reason.is_empty() => {
                        format!("closed by agent ({}): {}", frame.code, frame.reason)
                    }
                    Some(frame) => format!("closed by agent ({})", frame.code),
                    None => "closed by agent".to_string(),
                };
                notifier.fire(reason);
                return;
            }
            Ok(_) => {}
            Err(e) => {
                notifier.fire(format!("read failed: {}", e));
                return;
            }
        }
    }
    notifier.fire("connection ended".to_string());
}

/// Running transport. Owned by the voice session.
pub struct TransportHandle {
    shutdown: Option<oneshot::Sender<()>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    control: Option<mpsc::Sender<OutboundMessage>>,
    outbound: Arc<OutboundQueue>,
    notifier: Arc<CloseNotifier>,
}

impl TransportHandle {
    /// Close the connection. Sends a close frame if the socket is still writable.
    /// Idempotent, and never fires `on_closed`.
    pub async fn close(&mut self) {
        self.notifier.suppress();
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.outbound.close();
        self.control.take();

        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(WRITER_SHUTDOWN_GRACE, writer).await.is_err() {
                tracing::warn!("Voice writer did not stop in time, aborting");
                abort.abort();
            }
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        self.reader.as_ref().is_some_and(|r| !r.is_finished())
            && self.writer.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.notifier.suppress();
        self.outbound.close();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
