//! Sync queue items.
//!
//! A queue item is a mutation recorded locally that still has to be replayed
//! against the remote service. Items are created at write time and removed
//! either when replay succeeds or when the discard policy drops them.

use crate::time::now_millis;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// A mutation waiting in the sync queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Sequence number assigned by the store; ascending ids are enqueue order.
    pub id: i64,
    /// Action name used to pick the replay handler.
    pub action: String,
    pub payload: serde_json::Value,
    /// Milliseconds since Unix epoch when the item was enqueued.
    pub timestamp: i64,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl QueueItem {
    /// Age of the item relative to `now_ms`.
    pub fn age(&self, now_ms: i64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.timestamp).max(0) as u64)
    }

    /// Whether the item is older than `max_age`.
    pub fn is_stale(&self, now_ms: i64, max_age: Duration) -> bool {
        self.age(now_ms) > max_age
    }

    /// Whether the item has used up its retries.
    pub fn is_exhausted(&self, max_retries: u32) -> bool {
        self.retry_count >= max_retries
    }

    /// Returns why the item should be dropped without replay, if it should.
    /// Age and failure count are equivalent grounds.
    pub fn discard_reason(
        &self,
        now_ms: i64,
        max_age: Duration,
        max_retries: u32,
    ) -> Option<DiscardReason> {
        if self.is_exhausted(max_retries) {
            Some(DiscardReason::RetriesExhausted)
        } else if self.is_stale(now_ms, max_age) {
            Some(DiscardReason::Stale)
        } else {
            None
        }
    }

    /// Records a failed replay attempt.
    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.retry_count = self.retry_count.saturating_add(1);
        self.last_error = Some(error.into());
    }
}

/// A mutation about to be appended to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewQueueItem {
    pub action: String,
    pub payload: serde_json::Value,
    pub timestamp: i64,
}

impl NewQueueItem {
    pub fn new(action: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            action: action.into(),
            payload,
            timestamp: now_millis(),
        }
    }

    /// Overrides the enqueue timestamp.
    pub fn at(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Why a queue item was dropped without a successful replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Older than the staleness threshold.
    Stale,
    /// Reached the retry bound.
    RetriesExhausted,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stale => "stale",
            Self::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
