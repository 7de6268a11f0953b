//! Atomic message operations over the Redis structures.
//!
//! The template is the only component that knows the key layout. Scheduler,
//! reaper and poller all go through this trait; multi-step transitions run
//! as server-side scripts so a message is never observable in two
//! structures at once.

pub mod keys;
mod memory;
mod redis;

use async_trait::async_trait;

use crate::error::TemplateResult;
use crate::message::Message;
use crate::queue::QueueDescriptor;

pub use self::memory::MemoryTemplate;
pub use self::redis::RedisMessageTemplate;

/// Milliseconds since the Unix epoch. All scores and time comparisons in the
/// broker use this clock.
pub fn epoch_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A message popped from a ready list, together with the exact member bytes
/// that now sit in the processing set.
///
/// Ack, re-enqueue and DLQ moves all remove the member by value, so the
/// original bytes must be carried through — a re-serialization of `message`
/// is not guaranteed to be byte-identical.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub member: String,
}

/// Result of one scheduler/reaper drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// Members moved out of the sorted set this pass.
    pub moved: usize,
    /// Score of the earliest remaining member, used for adaptive sleeps.
    pub next_due_ms: Option<u64>,
}

/// Redis value type behind a key, as far as the broker cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyType {
    List,
    Zset,
    None,
    Other(String),
}

impl KeyType {
    pub(crate) fn from_type_reply(reply: &str) -> Self {
        match reply {
            "list" => KeyType::List,
            "zset" => KeyType::Zset,
            "none" => KeyType::None,
            other => KeyType::Other(other.to_string()),
        }
    }
}

/// Scoring policy for zset-to-zset bulk moves: either every member lands at
/// one fixed score, or each member's score is shifted by a signed delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreMode {
    Fixed(u64),
    Shift(i64),
}

/// Atomic operations over the per-queue Redis structures.
///
/// Implementations must make each operation atomic with respect to every
/// other: a message observed through this trait lives in exactly one of
/// {ready list, delayed set, processing set, DLQ list}.
#[async_trait]
pub trait MessageTemplate: Send + Sync {
    /// Route a message to the ready list, or to the delayed set when
    /// `process_at` is in the future. Writes the message metadata hash in
    /// the same step.
    async fn enqueue(&self, queue: &str, message: &Message) -> TemplateResult<()>;

    /// Atomically pop one ready message and insert it into the processing
    /// set with a `now + visibility_ms` deadline. One round trip; the
    /// returned message carries the live retry count.
    async fn pop_ready(&self, queue: &str, visibility_ms: u64) -> TemplateResult<Option<Delivery>>;

    /// Remove a processed message from the processing set and drop its
    /// metadata. Idempotent.
    async fn ack_processing(&self, queue: &str, delivery: &Delivery) -> TemplateResult<()>;

    /// Return an in-flight message to the queue, incrementing its retry
    /// count: into the delayed set when `delay_ms > 0`, else the ready
    /// list. Returns `false` when the member had already left the
    /// processing set (the reaper fired first).
    async fn re_enqueue(
        &self,
        queue: &str,
        delivery: &Delivery,
        delay_ms: u64,
    ) -> TemplateResult<bool>;

    /// Move an in-flight message to a dead-letter list, stamping
    /// `re_enqueued_at`. Returns `false` when the member had already left
    /// the processing set.
    async fn move_to_dlq(&self, queue: &str, dlq: &str, delivery: &Delivery)
        -> TemplateResult<bool>;

    /// Promote delayed messages with `score <= now` into the ready list,
    /// preserving score order, at most `limit` per pass.
    async fn promote_due(&self, queue: &str, now_ms: u64, limit: usize)
        -> TemplateResult<TickOutcome>;

    /// Return visibility-expired messages to the ready list, counting each
    /// as a retry attempt. Messages whose retry budget is exhausted are
    /// routed to the descriptor's dead-letter queue (or dropped when none
    /// is configured) instead of re-entering the ready list.
    async fn reap_expired(
        &self,
        descriptor: &QueueDescriptor,
        now_ms: u64,
        limit: usize,
    ) -> TemplateResult<TickOutcome>;

    /// Read-only pagination over a list key. `start`/`end` follow LRANGE
    /// semantics (inclusive, negative counts from the tail).
    async fn read_from_list(&self, key: &str, start: isize, end: isize)
        -> TemplateResult<Vec<Message>>;

    /// Read-only pagination over a zset key in score order.
    async fn read_from_zset(&self, key: &str, start: isize, end: isize)
        -> TemplateResult<Vec<Message>>;

    /// As [`read_from_zset`](Self::read_from_zset), with each member's score.
    async fn read_from_zset_with_scores(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> TemplateResult<Vec<(Message, u64)>>;

    /// Bulk moves used by the admin collaborator. Each moves at most
    /// `limit` members and returns the number moved.
    async fn move_list_to_list(&self, src: &str, dst: &str, limit: usize) -> TemplateResult<usize>;
    async fn move_zset_to_list(&self, src: &str, dst: &str, limit: usize) -> TemplateResult<usize>;
    async fn move_list_to_zset(
        &self,
        src: &str,
        dst: &str,
        limit: usize,
        score_ms: u64,
    ) -> TemplateResult<usize>;
    async fn move_zset_to_zset(
        &self,
        src: &str,
        dst: &str,
        limit: usize,
        score: ScoreMode,
    ) -> TemplateResult<usize>;

    /// Number of members behind `key` (LLEN or ZCARD depending on type;
    /// 0 for a missing key).
    async fn size(&self, key: &str) -> TemplateResult<u64>;

    /// Value type behind `key`.
    async fn key_type(&self, key: &str) -> TemplateResult<KeyType>;

    /// Persist a queue descriptor to the `<queue>:config` hash.
    async fn write_queue_config(&self, descriptor: &QueueDescriptor) -> TemplateResult<()>;

    /// Read a queue descriptor back from its config hash.
    async fn read_queue_config(&self, queue: &str) -> TemplateResult<Option<QueueDescriptor>>;
}

/// Decode a list/zset member back into a [`Message`].
pub(crate) fn decode_member(member: &str) -> TemplateResult<Message> {
    serde_json::from_str(member).map_err(|e| {
        crate::error::TemplateError::CorruptData(format!("undecodable member: {e}"))
    })
}

/// Serialize a [`Message`] into its member form.
pub(crate) fn encode_member(message: &Message) -> TemplateResult<String> {
    Ok(serde_json::to_string(message)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_type_maps_type_replies() {
        assert_eq!(KeyType::from_type_reply("list"), KeyType::List);
        assert_eq!(KeyType::from_type_reply("zset"), KeyType::Zset);
        assert_eq!(KeyType::from_type_reply("none"), KeyType::None);
        assert_eq!(
            KeyType::from_type_reply("hash"),
            KeyType::Other("hash".to_string())
        );
    }

    #[test]
    fn member_roundtrip_is_byte_identical() {
        let msg = Message::new("q", b"payload".to_vec(), 0, 42);
        let member = encode_member(&msg).unwrap();
        let decoded = decode_member(&member).unwrap();
        assert_eq!(encode_member(&decoded).unwrap(), member);
    }
}
