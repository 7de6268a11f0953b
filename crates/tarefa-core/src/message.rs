use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Core message domain type. This is the internal representation moved
/// between the Redis structures — the serialized form of this struct is the
/// list/zset member, so the template always carries the original member
/// bytes alongside a decoded `Message` (see [`crate::template::Delivery`]).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    /// Stable across retries and DLQ moves.
    pub id: Uuid,
    pub queue_name: String,
    pub payload: Vec<u8>,
    /// Scheduled delivery time in ms since epoch; 0 means immediate.
    pub process_at: u64,
    /// Enqueue time in ms since epoch.
    pub enqueued_at: u64,
    /// Attempts consumed so far. The live counter lives in the message
    /// metadata hash; this field is a snapshot taken at the last transition.
    pub retry_count: u32,
    /// Set when the message is retried or moved to a dead-letter queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub re_enqueued_at: Option<u64>,
    /// Per-message retry override. `None` means the queue policy applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl Message {
    /// Generate a new UUIDv7 message ID.
    pub fn new_id() -> Uuid {
        Uuid::now_v7()
    }

    /// Build a new message for `queue` carrying `payload`.
    ///
    /// `process_at = 0` enqueues for immediate delivery; any other value is
    /// the scheduled delivery time in ms since epoch.
    pub fn new(queue: impl Into<String>, payload: Vec<u8>, process_at: u64, now: u64) -> Self {
        Self {
            id: Self::new_id(),
            queue_name: queue.into(),
            payload,
            process_at,
            enqueued_at: now,
            retry_count: 0,
            re_enqueued_at: None,
            max_retries: None,
        }
    }

    /// Retry budget for this message: the per-message override if present,
    /// otherwise the queue policy passed in.
    pub fn effective_retries(&self, queue_retries: u32) -> u32 {
        self.max_retries.unwrap_or(queue_retries)
    }
}
