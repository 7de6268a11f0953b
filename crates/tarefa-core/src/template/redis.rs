use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::warn;

use super::{
    decode_member, encode_member, keys, Delivery, KeyType, MessageTemplate, ScoreMode, TickOutcome,
};
use crate::error::TemplateResult;
use crate::message::Message;
use crate::queue::QueueDescriptor;

const ENQUEUE_LUA: &str = include_str!("lua/enqueue.lua");
const POP_READY_LUA: &str = include_str!("lua/pop_ready.lua");
const PROMOTE_DUE_LUA: &str = include_str!("lua/promote_due.lua");
const REAP_EXPIRED_LUA: &str = include_str!("lua/reap_expired.lua");
const RE_ENQUEUE_LUA: &str = include_str!("lua/re_enqueue.lua");
const MOVE_TO_DLQ_LUA: &str = include_str!("lua/move_to_dlq.lua");
const MOVE_LIST_TO_LIST_LUA: &str = include_str!("lua/move_list_to_list.lua");
const MOVE_ZSET_TO_LIST_LUA: &str = include_str!("lua/move_zset_to_list.lua");
const MOVE_LIST_TO_ZSET_LUA: &str = include_str!("lua/move_list_to_zset.lua");
const MOVE_ZSET_TO_ZSET_LUA: &str = include_str!("lua/move_zset_to_zset.lua");

/// Production [`MessageTemplate`] over a shared Redis connection.
///
/// The connection manager reconnects on its own; every multi-step transition
/// is a server-side script, so concurrent pollers, reapers and schedulers
/// coordinate entirely through Redis.
#[derive(Clone)]
pub struct RedisMessageTemplate {
    conn: ConnectionManager,
    enqueue_script: Script,
    pop_ready_script: Script,
    promote_due_script: Script,
    reap_expired_script: Script,
    re_enqueue_script: Script,
    move_to_dlq_script: Script,
    move_list_to_list_script: Script,
    move_zset_to_list_script: Script,
    move_list_to_zset_script: Script,
    move_zset_to_zset_script: Script,
}

impl RedisMessageTemplate {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> TemplateResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self::with_connection(conn))
    }

    /// Build a template over an existing connection manager.
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self {
            conn,
            enqueue_script: Script::new(ENQUEUE_LUA),
            pop_ready_script: Script::new(POP_READY_LUA),
            promote_due_script: Script::new(PROMOTE_DUE_LUA),
            reap_expired_script: Script::new(REAP_EXPIRED_LUA),
            re_enqueue_script: Script::new(RE_ENQUEUE_LUA),
            move_to_dlq_script: Script::new(MOVE_TO_DLQ_LUA),
            move_list_to_list_script: Script::new(MOVE_LIST_TO_LIST_LUA),
            move_zset_to_list_script: Script::new(MOVE_ZSET_TO_LIST_LUA),
            move_list_to_zset_script: Script::new(MOVE_LIST_TO_ZSET_LUA),
            move_zset_to_zset_script: Script::new(MOVE_ZSET_TO_ZSET_LUA),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Decode members for the read-side, skipping ones that do not parse.
    /// The admin collaborator must keep working even if a foreign writer
    /// put junk in a list.
    fn decode_members(key: &str, members: Vec<String>) -> Vec<Message> {
        members
            .into_iter()
            .filter_map(|member| match decode_member(&member) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(%key, error = %e, "skipping undecodable member");
                    None
                }
            })
            .collect()
    }
}

#[async_trait]
impl MessageTemplate for RedisMessageTemplate {
    async fn enqueue(&self, queue: &str, message: &Message) -> TemplateResult<()> {
        let member = encode_member(message)?;
        let max_retries = message
            .max_retries
            .map(|r| r.to_string())
            .unwrap_or_default();
        let mut conn = self.conn();
        let _: i64 = self
            .enqueue_script
            .key(keys::ready_key(queue))
            .key(keys::delayed_key(queue))
            .key(keys::meta_key(&message.id))
            .arg(&member)
            .arg(message.process_at)
            .arg(super::epoch_ms())
            .arg(message.retry_count)
            .arg(max_retries)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop_ready(&self, queue: &str, visibility_ms: u64) -> TemplateResult<Option<Delivery>> {
        let deadline = super::epoch_ms() + visibility_ms;
        let mut conn = self.conn();
        let popped: Option<(String, i64)> = self
            .pop_ready_script
            .key(keys::ready_key(queue))
            .key(keys::processing_key(queue))
            .arg(deadline)
            .arg(keys::META_SUFFIX)
            .invoke_async(&mut conn)
            .await?;

        let Some((member, live_retry_count)) = popped else {
            return Ok(None);
        };
        let mut message = decode_member(&member)?;
        if live_retry_count >= 0 {
            message.retry_count = live_retry_count as u32;
        }
        Ok(Some(Delivery { message, member }))
    }

    async fn ack_processing(&self, queue: &str, delivery: &Delivery) -> TemplateResult<()> {
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .zrem(keys::processing_key(queue), &delivery.member)
            .del(keys::meta_key(&delivery.message.id))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn re_enqueue(
        &self,
        queue: &str,
        delivery: &Delivery,
        delay_ms: u64,
    ) -> TemplateResult<bool> {
        let now = super::epoch_ms();
        let mut updated = delivery.message.clone();
        updated.retry_count += 1;
        updated.re_enqueued_at = Some(now);
        let updated_member = encode_member(&updated)?;

        let mut conn = self.conn();
        let moved: i64 = self
            .re_enqueue_script
            .key(keys::processing_key(queue))
            .key(keys::ready_key(queue))
            .key(keys::delayed_key(queue))
            .key(keys::meta_key(&delivery.message.id))
            .arg(&delivery.member)
            .arg(&updated_member)
            .arg(delay_ms)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn move_to_dlq(
        &self,
        queue: &str,
        dlq: &str,
        delivery: &Delivery,
    ) -> TemplateResult<bool> {
        let now = super::epoch_ms();
        let mut updated = delivery.message.clone();
        updated.re_enqueued_at = Some(now);
        let updated_member = encode_member(&updated)?;

        let mut conn = self.conn();
        let moved: i64 = self
            .move_to_dlq_script
            .key(keys::processing_key(queue))
            .key(dlq)
            .key(keys::meta_key(&delivery.message.id))
            .arg(&delivery.member)
            .arg(&updated_member)
            .arg(now)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn promote_due(
        &self,
        queue: &str,
        now_ms: u64,
        limit: usize,
    ) -> TemplateResult<TickOutcome> {
        let mut conn = self.conn();
        let (moved, next_due): (i64, i64) = self
            .promote_due_script
            .key(keys::delayed_key(queue))
            .key(keys::ready_key(queue))
            .arg(now_ms)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(TickOutcome {
            moved: moved as usize,
            next_due_ms: (next_due >= 0).then_some(next_due as u64),
        })
    }

    async fn reap_expired(
        &self,
        descriptor: &QueueDescriptor,
        now_ms: u64,
        limit: usize,
    ) -> TemplateResult<TickOutcome> {
        let mut conn = self.conn();
        let (moved, next_deadline): (i64, i64) = self
            .reap_expired_script
            .key(keys::processing_key(&descriptor.name))
            .key(keys::ready_key(&descriptor.name))
            .arg(now_ms)
            .arg(limit)
            .arg(keys::META_SUFFIX)
            .arg(descriptor.num_retries)
            .arg(descriptor.primary_dead_letter_queue().unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;
        Ok(TickOutcome {
            moved: moved as usize,
            next_due_ms: (next_deadline >= 0).then_some(next_deadline as u64),
        })
    }

    async fn read_from_list(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> TemplateResult<Vec<Message>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.lrange(key, start, end).await?;
        Ok(Self::decode_members(key, members))
    }

    async fn read_from_zset(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> TemplateResult<Vec<Message>> {
        let mut conn = self.conn();
        let members: Vec<String> = conn.zrange(key, start, end).await?;
        Ok(Self::decode_members(key, members))
    }

    async fn read_from_zset_with_scores(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> TemplateResult<Vec<(Message, u64)>> {
        let mut conn = self.conn();
        let entries: Vec<(String, f64)> = conn.zrange_withscores(key, start, end).await?;
        Ok(entries
            .into_iter()
            .filter_map(|(member, score)| match decode_member(&member) {
                Ok(message) => Some((message, score as u64)),
                Err(e) => {
                    warn!(%key, error = %e, "skipping undecodable member");
                    None
                }
            })
            .collect())
    }

    async fn move_list_to_list(&self, src: &str, dst: &str, limit: usize) -> TemplateResult<usize> {
        let mut conn = self.conn();
        let moved: i64 = self
            .move_list_to_list_script
            .key(src)
            .key(dst)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved as usize)
    }

    async fn move_zset_to_list(&self, src: &str, dst: &str, limit: usize) -> TemplateResult<usize> {
        let mut conn = self.conn();
        let moved: i64 = self
            .move_zset_to_list_script
            .key(src)
            .key(dst)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved as usize)
    }

    async fn move_list_to_zset(
        &self,
        src: &str,
        dst: &str,
        limit: usize,
        score_ms: u64,
    ) -> TemplateResult<usize> {
        let mut conn = self.conn();
        let moved: i64 = self
            .move_list_to_zset_script
            .key(src)
            .key(dst)
            .arg(limit)
            .arg(score_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved as usize)
    }

    async fn move_zset_to_zset(
        &self,
        src: &str,
        dst: &str,
        limit: usize,
        score: ScoreMode,
    ) -> TemplateResult<usize> {
        let (mode, value) = match score {
            ScoreMode::Fixed(ms) => ("fixed", ms as i64),
            ScoreMode::Shift(delta) => ("shift", delta),
        };
        let mut conn = self.conn();
        let moved: i64 = self
            .move_zset_to_zset_script
            .key(src)
            .key(dst)
            .arg(limit)
            .arg(mode)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        Ok(moved as usize)
    }

    async fn size(&self, key: &str) -> TemplateResult<u64> {
        match self.key_type(key).await? {
            KeyType::List => {
                let mut conn = self.conn();
                Ok(conn.llen(key).await?)
            }
            KeyType::Zset => {
                let mut conn = self.conn();
                Ok(conn.zcard(key).await?)
            }
            KeyType::None | KeyType::Other(_) => Ok(0),
        }
    }

    async fn key_type(&self, key: &str) -> TemplateResult<KeyType> {
        let mut conn = self.conn();
        let reply: String = redis::cmd("TYPE").arg(key).query_async(&mut conn).await?;
        Ok(KeyType::from_type_reply(&reply))
    }

    async fn write_queue_config(&self, descriptor: &QueueDescriptor) -> TemplateResult<()> {
        let dlqs = serde_json::to_string(&descriptor.dead_letter_queues)?;
        let fields: [(&str, String); 4] = [
            ("delayed", u8::from(descriptor.delayed).to_string()),
            ("num_retries", descriptor.num_retries.to_string()),
            (
                "max_job_execution_time",
                descriptor.max_job_execution_time_ms.to_string(),
            ),
            ("dead_letter_queues", dlqs),
        ];
        let mut conn = self.conn();
        let _: () = conn
            .hset_multiple(keys::config_key(&descriptor.name), &fields)
            .await?;
        Ok(())
    }

    async fn read_queue_config(&self, queue: &str) -> TemplateResult<Option<QueueDescriptor>> {
        let mut conn = self.conn();
        let raw: HashMap<String, String> = conn.hgetall(keys::config_key(queue)).await?;
        if raw.is_empty() {
            return Ok(None);
        }
        let mut descriptor = QueueDescriptor::new(queue);
        descriptor.delayed = raw.get("delayed").map(String::as_str) == Some("1");
        if let Some(retries) = raw.get("num_retries").and_then(|v| v.parse().ok()) {
            descriptor.num_retries = retries;
        }
        if let Some(ms) = raw
            .get("max_job_execution_time")
            .and_then(|v| v.parse().ok())
        {
            descriptor.max_job_execution_time_ms = ms;
        }
        if let Some(dlqs) = raw
            .get("dead_letter_queues")
            .and_then(|v| serde_json::from_str(v).ok())
        {
            descriptor.dead_letter_queues = dlqs;
        }
        Ok(Some(descriptor))
    }
}
