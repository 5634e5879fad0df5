//! # Keepalive Responder
//!
//! The agent probes liveness with `ping` frames that name a delay. Each ping gets
//! exactly one `pong` carrying the same `event_id`, sent no earlier than the delay.
//!
//! ## Timers:
//! - One tokio task per ping; concurrent pings never coalesce
//! - Timers hold only a weak sender to the transport control channel, so a pong
//!   due after the transport closed is silently skipped
//! - [`KeepAliveResponder::cancel_all`] aborts every pending timer and makes the
//!   responder ignore later pings

use crate::voice::protocol::{EventId, OutboundMessage};
use crate::voice::stats::SessionStats;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct KeepAliveResponder {
    control: mpsc::WeakSender<OutboundMessage>,
    default_delay: Duration,
    pending: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
    next_task: AtomicU64,
    cancelled: Arc<AtomicBool>,
    stats: Arc<SessionStats>,
}

impl KeepAliveResponder {
    pub fn new(
        control: mpsc::WeakSender<OutboundMessage>,
        default_delay: Duration,
        stats: Arc<SessionStats>,
    ) -> Self {
        Self {
            control,
            default_delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_task: AtomicU64::new(0),
            cancelled: Arc::new(AtomicBool::new(false)),
            stats,
        }
    }

    /// Schedule the pong for one ping. Returns `false` when the responder has been
    /// cancelled and the ping is ignored. Must be called from within a tokio runtime.
    pub fn schedule(&self, event_id: EventId, delay_ms: Option<u64>) -> bool {
        SessionStats::bump(&self.stats.pings_received);
        if self.cancelled.load(Ordering::Acquire) {
            tracing::debug!(%event_id, "Keepalive cancelled, ignoring ping");
            return false;
        }

        let delay = delay_ms.map(Duration::from_millis).unwrap_or(self.default_delay);
        let task_id = self.next_task.fetch_add(1, Ordering::Relaxed);
        let control = self.control.clone();
        let cancelled = self.cancelled.clone();
        let pending = self.pending.clone();

        // Held across spawn+insert so the task's own removal cannot run first.
        let mut tasks = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|_, handle| !handle.is_finished());

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            if !cancelled.load(Ordering::Acquire) {
                match control.upgrade() {
                    Some(sender) => {
                        if sender.send(OutboundMessage::pong(event_id.clone())).await.is_err() {
                            tracing::debug!(%event_id, "Transport gone, pong skipped");
                        } else {
                            tracing::trace!(%event_id, delay_ms = delay.as_millis() as u64, "Pong queued");
                        }
                    }
                    None => tracing::debug!(%event_id, "Transport gone, pong skipped"),
                }
            }

            pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&task_id);
        });
        tasks.insert(task_id, handle);
        true
    }

    /// Number of pongs still waiting on their timer.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Abort every pending timer. Later pings are ignored.
    pub fn cancel_all(&self) {
        self.cancelled.store(true, Ordering::Release);
        let tasks: Vec<JoinHandle<()>> = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        if !tasks.is_empty() {
            tracing::debug!(count = tasks.len(), "Cancelling pending pongs");
        }
        for handle in tasks {
            handle.abort();
        }
    }
}

impl Drop for KeepAliveResponder {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
