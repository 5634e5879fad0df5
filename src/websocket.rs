//! # Transcript Feed WebSocket
//!
//! Live view of the conversation for operator UIs. Clients connect to
//! `/ws/transcript` (optionally `?since=N`) and receive JSON messages; nothing the
//! client sends is interpreted beyond WebSocket control frames.
//!
//! ## Message Flow:
//! 1. **snapshot**: entries recorded so far (after ordinal `since`) and the
//!    current session status
//! 2. **entry**: every new transcript entry, in ordinal order
//! 3. **status**: every session status change
//! 4. **lagged**: the client fell behind and `missed` entries were skipped; it can
//!    fetch them from `GET /api/v1/transcript?since=N`
//!
//! ## Actor Model:
//! One [`TranscriptFeed`] actor per connection. Transcript broadcasts and status
//! changes are merged into a single stream attached to the actor's context, so
//! the actor never touches shared state after the snapshot.

use crate::state::AppState;
use crate::voice::{SessionStatus, TranscriptEntry};
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::{BroadcastStream, WatchStream};
use tracing::{debug, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Messages sent to feed clients.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    Snapshot {
        status: SessionStatus,
        entries: Vec<TranscriptEntry>,
    },
    Entry {
        entry: TranscriptEntry,
    },
    Status {
        status: SessionStatus,
    },
    Lagged {
        missed: u64,
    },
}

/// Items of the merged per-connection stream.
#[derive(Debug)]
pub enum FeedEvent {
    Entry(TranscriptEntry),
    Lagged(u64),
    Status(SessionStatus),
}

#[derive(Debug, Default, Deserialize)]
pub struct FeedQuery {
    pub since: Option<u64>,
}

pub struct TranscriptFeed {
    state: web::Data<AppState>,
    since: u64,

    /// Highest ordinal delivered; later duplicates are skipped.
    last_ordinal: u64,
    last_status: Option<SessionStatus>,
    last_heartbeat: Instant,
}

impl TranscriptFeed {
    pub fn new(state: web::Data<AppState>, since: u64) -> Self {
        Self {
            state,
            since,
            last_ordinal: since,
            last_status: None,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, message: &FeedMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::to_string(message) {
            Ok(json) => ctx.text(json),
            Err(err) => warn!("Failed to serialize feed message: {}", err),
        }
    }
}

impl Actor for TranscriptFeed {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let (history, receiver) = self.state.voice.transcript().subscribe();
        let status = self.state.voice.status();

        let entries: Vec<TranscriptEntry> = history
            .into_iter()
            .filter(|entry| entry.ordinal > self.since)
            .collect();
        if let Some(last) = entries.last() {
            self.last_ordinal = last.ordinal;
        }
        self.last_status = Some(status);
        info!(since = self.since, replayed = entries.len(), "Transcript feed started");
        self.send(&FeedMessage::Snapshot { status, entries }, ctx);

        let transcript = BroadcastStream::new(receiver).map(|item| match item {
            Ok(entry) => FeedEvent::Entry(entry),
            Err(BroadcastStreamRecvError::Lagged(missed)) => FeedEvent::Lagged(missed),
        });
        let statuses = WatchStream::new(self.state.voice.subscribe_status()).map(FeedEvent::Status);
        ctx.add_stream(stream::select(transcript, statuses));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("Transcript feed heartbeat timeout, closing connection");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(last_ordinal = self.last_ordinal, "Transcript feed stopped");
    }
}

impl StreamHandler<FeedEvent> for TranscriptFeed {
    fn handle(&mut self, event: FeedEvent, ctx: &mut Self::Context) {
        match event {
            FeedEvent::Entry(entry) => {
                if entry.ordinal <= self.last_ordinal {
                    return;
                }
                self.last_ordinal = entry.ordinal;
                self.send(&FeedMessage::Entry { entry }, ctx);
            }
            FeedEvent::Lagged(missed) => {
                warn!(missed, "Transcript feed client lagged");
                self.send(&FeedMessage::Lagged { missed }, ctx);
            }
            FeedEvent::Status(status) => {
                if self.last_status == Some(status) {
                    return;
                }
                self.last_status = Some(status);
                self.send(&FeedMessage::Status { status }, ctx);
            }
        }
    }

    // The sources outlive every connection; ending here must not stop the actor.
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("Transcript feed sources ended");
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TranscriptFeed {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(data)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(_)) | Ok(ws::Message::Binary(_)) => {
                self.last_heartbeat = Instant::now();
                debug!("Ignoring client payload on transcript feed");
            }
            Ok(ws::Message::Close(reason)) => {
                info!("Transcript feed closed by client: {:?}", reason);
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                warn!("Transcript feed protocol error: {}", err);
                ctx.stop();
            }
        }
    }
}

/// `GET /ws/transcript`: upgrade to the live transcript feed.
pub async fn transcript_websocket(
    req: HttpRequest,
    stream: web::Payload,
    query: web::Query<FeedQuery>,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!("New transcript feed connection from: {:?}", req.connection_info().peer_addr());
    let feed = TranscriptFeed::new(app_state, query.since.unwrap_or(0));
    ws::start(feed, &req, stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::tests::test_state;
    use crate::voice::Speaker;
    use actix_web::{App, HttpServer};
    use futures_util::StreamExt as _;
    use serde_json::Value;
    use tokio_tungstenite::tungstenite::Message;

    async fn next_json<S>(ws: &mut S) -> Value
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let next = async {
            while let Some(frame) = ws.next().await {
                if let Ok(Message::Text(text)) = frame {
                    return serde_json::from_str(&text).unwrap();
                }
            }
            panic!("feed closed");
        };
        tokio::time::timeout(Duration::from_secs(5), next).await.unwrap()
    }

    #[test]
    fn test_feed_message_shape() {
        let json = serde_json::to_value(FeedMessage::Status {
            status: SessionStatus::Streaming,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"type": "status", "status": "streaming"}));
    }

    #[actix_web::test]
    async fn test_feed_replays_then_streams() {
        let (state, _) = test_state(AppConfig::default());
        let transcript = state.voice.transcript().clone();
        transcript.record(Speaker::User, "load the blue crates first");
        transcript.record(Speaker::Agent, "understood");

        let data = web::Data::new(state);
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(data.clone())
                .route("/ws/transcript", web::get().to(transcript_websocket))
        })
        .workers(1)
        .listen(listener)
        .unwrap()
        .run();
        let handle = server.handle();
        actix_web::rt::spawn(server);

        let url = format!("ws://{}/ws/transcript?since=1", addr);
        let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

        let snapshot = next_json(&mut ws).await;
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["status"], "disconnected");
        assert_eq!(snapshot["entries"].as_array().unwrap().len(), 1);
        assert_eq!(snapshot["entries"][0]["text"], "understood");

        transcript.record(Speaker::Agent, "plan ready");
        let entry = next_json(&mut ws).await;
        assert_eq!(entry["type"], "entry");
        assert_eq!(entry["entry"]["ordinal"], 3);
        assert_eq!(entry["entry"]["speaker"], "agent");

        handle.stop(false).await;
    }
}
