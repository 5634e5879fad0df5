//! Test rig shared by the voice, planning and HTTP tests: a scripted audio device,
//! an in-process agent endpoint speaking the voice-stream protocol, and a canned
//! HTTP responder for the planning collaborators.

use crate::audio::decoder::DecodedAudio;
use crate::audio::device::{AudioDevice, CaptureConfig, FrameCallback, InputStream, OutputSink};
use crate::voice::error::{VoiceError, VoiceResult};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

const WAIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds, failing the test after a few seconds.
pub async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", WAIT);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// URL of a port nothing is listening on.
pub async fn unused_ws_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("ws://{}/voice-stream", addr)
}

type CallbackSlot = Arc<Mutex<Option<FrameCallback>>>;

/// Audio device driven by the test: permission can be revoked, samples are fed by
/// hand and played clips are recorded.
pub struct ScriptedDevice {
    permitted: AtomicBool,
    callback: CallbackSlot,
    opens: AtomicUsize,
    played: Arc<Mutex<Vec<DecodedAudio>>>,
    outputs_opened: Arc<AtomicUsize>,
}

impl ScriptedDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            permitted: AtomicBool::new(true),
            callback: Arc::new(Mutex::new(None)),
            opens: AtomicUsize::new(0),
            played: Arc::new(Mutex::new(Vec::new())),
            outputs_opened: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn deny(&self) {
        self.permitted.store(false, Ordering::SeqCst);
    }

    /// Deliver one device buffer. Returns `false` when no capture is running.
    pub fn feed(&self, samples: &[f32]) -> bool {
        match self.callback.lock().unwrap().as_mut() {
            Some(callback) => {
                callback(samples);
                true
            }
            None => false,
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn played(&self) -> Vec<DecodedAudio> {
        self.played.lock().unwrap().clone()
    }

    pub fn outputs_opened(&self) -> usize {
        self.outputs_opened.load(Ordering::SeqCst)
    }
}

struct ScriptedInput {
    slot: CallbackSlot,
    sample_rate: u32,
}

impl InputStream for ScriptedInput {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl Drop for ScriptedInput {
    fn drop(&mut self) {
        self.slot.lock().unwrap().take();
    }
}

struct RecordingSink {
    played: Arc<Mutex<Vec<DecodedAudio>>>,
}

impl OutputSink for RecordingSink {
    fn play(&self, clip: DecodedAudio) -> VoiceResult<()> {
        self.played.lock().unwrap().push(clip);
        Ok(())
    }
}

impl AudioDevice for ScriptedDevice {
    fn name(&self) -> &str {
        "scripted"
    }

    fn request_input_access(&self) -> VoiceResult<()> {
        if self.permitted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(VoiceError::PermissionDenied("denied by test".to_string()))
        }
    }

    fn open_input(
        &self,
        config: &CaptureConfig,
        on_samples: FrameCallback,
    ) -> VoiceResult<Box<dyn InputStream>> {
        let mut slot = self.callback.lock().unwrap();
        if slot.is_some() {
            return Err(VoiceError::DeviceError("microphone already in use".to_string()));
        }
        *slot = Some(on_samples);
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedInput {
            slot: self.callback.clone(),
            sample_rate: config.sample_rate,
        }))
    }

    fn open_output(&self) -> VoiceResult<Arc<dyn OutputSink>> {
        self.outputs_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(RecordingSink {
            played: self.played.clone(),
        }))
    }
}

/// In-process voice agent. Accepts WebSocket connections in the background.
pub struct FakeAgent {
    addr: SocketAddr,
    connections: tokio::sync::Mutex<mpsc::UnboundedReceiver<AgentConnection>>,
    task: JoinHandle<()>,
}

impl FakeAgent {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    if tx.send(AgentConnection { ws }).is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            addr,
            connections: tokio::sync::Mutex::new(rx),
            task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/voice-stream", self.addr)
    }

    pub async fn accept(&self) -> AgentConnection {
        let mut connections = self.connections.lock().await;
        tokio::time::timeout(WAIT, connections.recv())
            .await
            .expect("no client connected")
            .expect("agent listener stopped")
    }
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Agent side of one client connection.
pub struct AgentConnection {
    ws: WebSocketStream<TcpStream>,
}

impl AgentConnection {
    pub async fn send_json(&mut self, value: Value) {
        self.send_raw(&value.to_string()).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws.send(Message::Text(text.to_string())).await.unwrap();
    }

    /// Next text frame as JSON, failing the test on timeout or close.
    pub async fn recv_json(&mut self) -> Value {
        self.try_recv_json(WAIT)
            .await
            .expect("expected a frame from the client")
    }

    /// Next text frame within `wait`, or `None` on timeout or close.
    pub async fn try_recv_json(&mut self, wait: Duration) -> Option<Value> {
        let next_text = async {
            while let Some(frame) = self.ws.next().await {
                match frame {
                    Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                    Ok(Message::Close(_)) | Err(_) => return None,
                    Ok(_) => continue,
                }
            }
            None
        };
        tokio::time::timeout(wait, next_text).await.ok().flatten()
    }

    /// Every text frame received until the client closes.
    pub async fn recv_until_close(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        let collect = async {
            while let Some(frame) = self.ws.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if let Ok(value) = serde_json::from_str(&text) {
                            frames.push(value);
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        let _ = tokio::time::timeout(WAIT, collect).await;
        frames
    }

    /// Close from the agent side and wait for the client's reply.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while let Some(frame) = self.ws.next().await {
                if frame.is_err() {
                    break;
                }
            }
        })
        .await;
    }
}

/// Endpoint that accepts TCP connections and holds them open without ever
/// answering the WebSocket handshake.
pub struct SilentAgent {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl SilentAgent {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let counter = accepted.clone();
        let task = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                held.push(stream);
            }
        });

        Self { addr, accepted, task }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/voice-stream", self.addr)
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for SilentAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One-shot HTTP responder standing in for the planning collaborators. Serves the
/// canned responses in order, one connection each, and records the raw requests.
pub struct CannedHttp {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl CannedHttp {
    pub async fn start(responses: Vec<(u16, Value)>) -> Self {
        use tokio::io::AsyncWriteExt;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let request = read_http_request(&mut stream).await;
                recorded.lock().unwrap().push(request);

                let body = body.to_string();
                let reason = if status < 400 { "OK" } else { "Error" };
                let response = format!(
                    "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    reason,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        Self { addr, requests, task }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Raw requests received so far (lossy UTF-8).
    pub async fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for CannedHttp {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_http_request(stream: &mut TcpStream) -> String {
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match tokio::time::timeout(WAIT, stream.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => n,
            _ => break,
        };
        buf.extend_from_slice(&chunk[..n]);

        let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4) else {
            continue;
        };
        let headers = String::from_utf8_lossy(&buf[..header_end]).to_ascii_lowercase();
        let content_length = headers
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok());

        match content_length {
            Some(len) if buf.len() >= header_end + len => break,
            Some(_) => continue,
            None if headers.contains("transfer-encoding: chunked") => {
                if buf.ends_with(b"0\r\n\r\n") {
                    break;
                }
            }
            None => break,
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}
