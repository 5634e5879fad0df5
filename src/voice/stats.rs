//! Per-session counters shared between the capture callback, the transport tasks
//! and the dispatcher. Relaxed atomics: the numbers are diagnostics, not
//! synchronization.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct SessionStats {
    pub frames_captured: AtomicU64,
    pub chunks_sent: AtomicU64,
    pub chunks_dropped: AtomicU64,
    pub pings_received: AtomicU64,
    pub pongs_sent: AtomicU64,
    pub clips_played: AtomicU64,
    pub clips_dropped: AtomicU64,
    pub decode_errors: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub unknown_messages: AtomicU64,
}

/// Point-in-time copy of [`SessionStats`] for API responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub chunks_sent: u64,
    pub chunks_dropped: u64,
    pub pings_received: u64,
    pub pongs_sent: u64,
    pub clips_played: u64,
    pub clips_dropped: u64,
    pub decode_errors: u64,
    pub protocol_errors: u64,
    pub unknown_messages: u64,
}

impl SessionStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let read = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            frames_captured: read(&self.frames_captured),
            chunks_sent: read(&self.chunks_sent),
            chunks_dropped: read(&self.chunks_dropped),
            pings_received: read(&self.pings_received),
            pongs_sent: read(&self.pongs_sent),
            clips_played: read(&self.clips_played),
            clips_dropped: read(&self.clips_dropped),
            decode_errors: read(&self.decode_errors),
            protocol_errors: read(&self.protocol_errors),
            unknown_messages: read(&self.unknown_messages),
        }
    }
}
