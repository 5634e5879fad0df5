//! # Conversation Transcript
//!
//! Append-only log of both sides of the conversation. Entries are numbered in
//! arrival order and never reordered, merged, or removed. New entries are also
//! broadcast so the transcript feed can push them live.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::broadcast;

const FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Agent,
}

impl Speaker {
    /// Label shown next to the text in a rendered conversation.
    pub fn label(&self) -> &'static str {
        match self {
            Speaker::User => "You",
            Speaker::Agent => "AI",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    /// 1-based, strictly increasing.
    pub ordinal: u64,
    pub speaker: Speaker,
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

pub struct TranscriptAggregator {
    entries: Mutex<Vec<TranscriptEntry>>,
    feed: broadcast::Sender<TranscriptEntry>,
}

impl Default for TranscriptAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl TranscriptAggregator {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            entries: Mutex::new(Vec::new()),
            feed,
        }
    }

    /// Append an entry and publish it to subscribers.
    pub fn record(&self, speaker: Speaker, text: impl Into<String>) -> TranscriptEntry {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = TranscriptEntry {
            ordinal: entries.len() as u64 + 1,
            speaker,
            text: text.into(),
            recorded_at: Utc::now(),
        };
        entries.push(entry.clone());
        // Published under the lock so subscribers see ordinals in order.
        let _ = self.feed.send(entry.clone());
        drop(entries);

        tracing::debug!(ordinal = entry.ordinal, speaker = entry.speaker.label(), "Transcript entry recorded");
        entry
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Entries with an ordinal greater than `ordinal`.
    pub fn since(&self, ordinal: u64) -> Vec<TranscriptEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let start = (ordinal as usize).min(entries.len());
        entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot plus a receiver for everything recorded afterwards, taken atomically.
    pub fn subscribe(&self) -> (Vec<TranscriptEntry>, broadcast::Receiver<TranscriptEntry>) {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        (entries.clone(), self.feed.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_keep_arrival_order() {
        let transcript = TranscriptAggregator::new();
        assert!(transcript.is_empty());
        transcript.record(Speaker::User, "hi");
        transcript.record(Speaker::Agent, "hello");
        transcript.record(Speaker::Agent, "hello");
        assert!(!transcript.is_empty());

        let entries = transcript.entries();
        let view: Vec<(u64, Speaker, &str)> = entries
            .iter()
            .map(|e| (e.ordinal, e.speaker, e.text.as_str()))
            .collect();
        assert_eq!(
            view,
            vec![
                (1, Speaker::User, "hi"),
                (2, Speaker::Agent, "hello"),
                (3, Speaker::Agent, "hello"),
            ]
        );
    }

    #[test]
    fn test_since_returns_tail() {
        let transcript = TranscriptAggregator::new();
        for text in ["a", "b", "c"] {
            transcript.record(Speaker::User, text);
        }
        let tail: Vec<String> = transcript.since(1).into_iter().map(|e| e.text).collect();
        assert_eq!(tail, vec!["b", "c"]);
        assert!(transcript.since(10).is_empty());
        assert_eq!(transcript.since(0).len(), 3);
    }

    #[tokio::test]
    async fn test_subscribers_see_new_entries_only() {
        let transcript = TranscriptAggregator::new();
        transcript.record(Speaker::User, "before");

        let (snapshot, mut feed) = transcript.subscribe();
        assert_eq!(snapshot.len(), 1);

        transcript.record(Speaker::Agent, "after");
        let live = feed.recv().await.unwrap();
        assert_eq!(live.ordinal, 2);
        assert_eq!(live.text, "after");
    }

    #[test]
    fn test_speaker_serialization() {
        assert_eq!(serde_json::to_string(&Speaker::Agent).unwrap(), "\"agent\"");
        assert_eq!(Speaker::User.label(), "You");
    }
}
