use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One outbound write waiting in a sync stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    pub id: String,
    pub payload: Value,
    #[serde(default)]
    pub retries: u32,
    /// Milliseconds since the Unix epoch.
    pub created_at: u64,
    /// Milliseconds since the Unix epoch.
    pub next_attempt_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_status: Option<u16>,
}

impl QueueItem {
    #[must_use]
    pub fn new(id: String, payload: Value, now_ms: u64) -> Self {
        Self {
            id,
            payload,
            retries: 0,
            created_at: now_ms,
            next_attempt_at: now_ms,
            last_error_status: None,
        }
    }

    #[must_use]
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_attempt_at <= now_ms
    }
}

/// Terminal record for an item that will never be retried.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    #[serde(flatten)]
    pub item: QueueItem,
    pub reason: String,
    pub dead_lettered_at: u64,
}

/// Counts reported by a flush pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlushSummary {
    pub sent: usize,
    pub remaining: usize,
    pub deferred: usize,
    pub dead_lettered: usize,
}
