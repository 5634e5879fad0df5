//! # Outbound Audio Queue
//!
//! Bounded FIFO between the microphone callback (producer) and the transport writer
//! task (consumer). The producer side never blocks and never awaits, so it is safe to
//! call from the audio device thread.
//!
//! ## Overflow:
//! When the agent connection stalls the queue fills up. Instead of growing without
//! limit it applies an [`OverflowPolicy`]:
//! - **drop_oldest**: evict the head and keep the freshest speech (default)
//! - **drop_newest**: reject the incoming chunk and keep what is already queued
//!
//! Every dropped chunk is counted in `chunks_dropped` and logged.

use crate::audio::capture::OutboundChunk;
use crate::voice::stats::SessionStats;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    #[default]
    DropOldest,
    DropNewest,
}

/// Result of a single [`OutboundQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the chunk with this sequence number.
    QueuedEvicted(u64),
    /// The incoming chunk was rejected.
    Rejected,
    /// The queue was closed; nothing is accepted anymore.
    Closed,
}

/// Bounded, thread-safe chunk queue with async consumption.
///
/// ## Thread Safety:
/// The deque sits behind a `std::sync::Mutex` held only for O(1) operations, never
/// across an await. The consumer parks on a [`Notify`] when the queue is empty.
pub struct OutboundQueue {
    chunks: Mutex<VecDeque<OutboundChunk>>,
    capacity: usize,
    policy: OverflowPolicy,
    ready: Notify,
    closed: AtomicBool,
    stats: Arc<SessionStats>,
}

impl OutboundQueue {
    /// Create a queue holding at most `capacity` chunks (minimum 1).
    pub fn new(capacity: usize, policy: OverflowPolicy, stats: Arc<SessionStats>) -> Self {
        let capacity = capacity.max(1);
        Self {
            chunks: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            stats,
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<OutboundChunk>> {
        // A panicking producer must not wedge the writer.
        self.chunks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Enqueue a chunk without blocking.
    pub fn push(&self, chunk: OutboundChunk) -> PushOutcome {
        if self.closed.load(Ordering::Acquire) {
            return PushOutcome::Closed;
        }

        let outcome = {
            let mut chunks = self.lock();
            if chunks.len() < self.capacity {
                chunks.push_back(chunk);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        let evicted = chunks.pop_front().map(|c| c.sequence).unwrap_or_default();
                        chunks.push_back(chunk);
                        PushOutcome::QueuedEvicted(evicted)
                    }
                    OverflowPolicy::DropNewest => PushOutcome::Rejected,
                }
            }
        };

        match outcome {
            PushOutcome::Queued => self.ready.notify_one(),
            PushOutcome::QueuedEvicted(sequence) => {
                SessionStats::bump(&self.stats.chunks_dropped);
                tracing::warn!(sequence, capacity = self.capacity, "Outbound queue full, dropped oldest chunk");
                self.ready.notify_one();
            }
            PushOutcome::Rejected => {
                SessionStats::bump(&self.stats.chunks_dropped);
                tracing::warn!(capacity = self.capacity, "Outbound queue full, dropped newest chunk");
            }
            PushOutcome::Closed => {}
        }
        outcome
    }

    /// Wait for the next chunk in FIFO order. Returns `None` once the queue is closed;
    /// chunks still queued at that point are discarded.
    pub async fn pop(&self) -> Option<OutboundChunk> {
        loop {
            // Register interest before checking so a push between the check and the
            // await is not lost.
            let notified = self.ready.notified();
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            if let Some(chunk) = self.lock().pop_front() {
                return Some(chunk);
            }
            notified.await;
        }
    }

    /// Stop accepting chunks and wake the consumer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.lock().clear();
        self.ready.notify_waiters();
        self.ready.notify_one();
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
