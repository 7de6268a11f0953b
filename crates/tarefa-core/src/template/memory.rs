use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    decode_member, encode_member, keys, Delivery, KeyType, MessageTemplate, ScoreMode, TickOutcome,
};
use crate::error::TemplateResult;
use crate::message::Message;
use crate::queue::QueueDescriptor;

/// In-process implementation of the [`MessageTemplate`] contract over a
/// mutex-guarded model of the key space.
///
/// Backs the core test-suite and local development without a Redis. Each
/// operation holds the lock for its whole duration, mirroring the atomicity
/// of the server-side scripts.
#[derive(Default)]
pub struct MemoryTemplate {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// front = list head (LPUSH side), back = tail (RPOP side).
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Zset>,
    metas: HashMap<String, Meta>,
    configs: HashMap<String, QueueDescriptor>,
}

#[derive(Default)]
struct Zset {
    by_score: BTreeSet<(u64, String)>,
    score_of: HashMap<String, u64>,
}

#[derive(Default, Clone)]
struct Meta {
    retry_count: u32,
    max_retries: Option<u32>,
    re_enqueued_at: Option<u64>,
}

impl Zset {
    fn insert(&mut self, score: u64, member: String) {
        if let Some(old) = self.score_of.insert(member.clone(), score) {
            self.by_score.remove(&(old, member.clone()));
        }
        self.by_score.insert((score, member));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.score_of.remove(member) {
            Some(score) => self.by_score.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn due(&self, now: u64, limit: usize) -> Vec<(u64, String)> {
        self.by_score
            .iter()
            .take_while(|(score, _)| *score <= now)
            .take(limit)
            .cloned()
            .collect()
    }

    fn first_score(&self) -> Option<u64> {
        self.by_score.iter().next().map(|(score, _)| *score)
    }

    fn len(&self) -> usize {
        self.by_score.len()
    }
}

impl Inner {
    fn lpush(&mut self, key: &str, member: String) {
        self.lists.entry(key.to_string()).or_default().push_front(member);
    }

    fn rpop(&mut self, key: &str) -> Option<String> {
        self.lists.get_mut(key).and_then(VecDeque::pop_back)
    }

    fn zset(&mut self, key: &str) -> &mut Zset {
        self.zsets.entry(key.to_string()).or_default()
    }

    fn meta(&mut self, key: String) -> &mut Meta {
        self.metas.entry(key).or_default()
    }

    /// Mirror of the reap script: each expired member consumes a retry
    /// attempt; exhausted members go to the DLQ or are dropped.
    fn reap(&mut self, descriptor: &QueueDescriptor, now: u64, limit: usize) -> TickOutcome {
        let processing = keys::processing_key(&descriptor.name);
        let expired = self.zset(&processing).due(now, limit);
        for (_, member) in &expired {
            self.zset(&processing).remove(member);
            let meta_key = decode_member(member).ok().map(|m| keys::meta_key(&m.id));
            let budget = meta_key
                .as_ref()
                .and_then(|k| self.metas.get(k))
                .and_then(|m| m.max_retries)
                .unwrap_or(descriptor.num_retries);
            let count = match &meta_key {
                Some(k) => {
                    let meta = self.meta(k.clone());
                    meta.retry_count += 1;
                    meta.retry_count
                }
                None => budget + 1,
            };
            if count > budget {
                match descriptor.primary_dead_letter_queue() {
                    Some(dlq) => {
                        let dlq = dlq.to_string();
                        if let Some(k) = &meta_key {
                            self.meta(k.clone()).re_enqueued_at = Some(now);
                        }
                        self.lpush(&dlq, member.clone());
                    }
                    None => {
                        if let Some(k) = &meta_key {
                            self.metas.remove(k);
                        }
                    }
                }
            } else {
                let ready = keys::ready_key(&descriptor.name);
                self.lpush(&ready, member.clone());
            }
        }
        TickOutcome {
            moved: expired.len(),
            next_due_ms: self.zset(&processing).first_score(),
        }
    }
}

/// Translate LRANGE/ZRANGE start/end (inclusive, negatives from the tail)
/// into a `[from, to)` slice range.
fn range_bounds(len: usize, start: isize, end: isize) -> (usize, usize) {
    let resolve = |idx: isize| -> isize {
        if idx < 0 {
            idx + len as isize
        } else {
            idx
        }
    };
    let from = resolve(start).max(0) as usize;
    let to = resolve(end);
    if to < 0 {
        return (0, 0);
    }
    let to = (to as usize + 1).min(len);
    if from >= to {
        (0, 0)
    } else {
        (from, to)
    }
}

impl MemoryTemplate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory template lock poisoned")
    }
}

#[async_trait]
impl MessageTemplate for MemoryTemplate {
    async fn enqueue(&self, queue: &str, message: &Message) -> TemplateResult<()> {
        let member = encode_member(message)?;
        let now = super::epoch_ms();
        let mut inner = self.lock();
        let meta = inner.meta(keys::meta_key(&message.id));
        meta.retry_count = message.retry_count;
        meta.max_retries = message.max_retries;
        if message.process_at > now {
            inner
                .zset(&keys::delayed_key(queue))
                .insert(message.process_at, member);
        } else {
            inner.lpush(&keys::ready_key(queue), member);
        }
        Ok(())
    }

    async fn pop_ready(&self, queue: &str, visibility_ms: u64) -> TemplateResult<Option<Delivery>> {
        let deadline = super::epoch_ms() + visibility_ms;
        let mut inner = self.lock();
        let Some(member) = inner.rpop(&keys::ready_key(queue)) else {
            return Ok(None);
        };
        inner
            .zset(&keys::processing_key(queue))
            .insert(deadline, member.clone());
        let mut message = decode_member(&member)?;
        if let Some(meta) = inner.metas.get(&keys::meta_key(&message.id)) {
            message.retry_count = meta.retry_count;
        }
        Ok(Some(Delivery { message, member }))
    }

    async fn ack_processing(&self, queue: &str, delivery: &Delivery) -> TemplateResult<()> {
        let mut inner = self.lock();
        inner
            .zset(&keys::processing_key(queue))
            .remove(&delivery.member);
        inner.metas.remove(&keys::meta_key(&delivery.message.id));
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

        let mut inner = self.lock();
        if !inner
            .zset(&keys::processing_key(queue))
            .remove(&delivery.member)
        {
            return Ok(false);
        }
        let meta = inner.meta(keys::meta_key(&delivery.message.id));
        meta.retry_count += 1;
        meta.re_enqueued_at = Some(now);
        if delay_ms > 0 {
            inner
                .zset(&keys::delayed_key(queue))
                .insert(now + delay_ms, updated_member);
        } else {
            inner.lpush(&keys::ready_key(queue), updated_member);
        }
        Ok(true)
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

        let mut inner = self.lock();
        if !inner
            .zset(&keys::processing_key(queue))
            .remove(&delivery.member)
        {
            return Ok(false);
        }
        inner.meta(keys::meta_key(&delivery.message.id)).re_enqueued_at = Some(now);
        inner.lpush(dlq, updated_member);
        Ok(true)
    }

    async fn promote_due(
        &self,
        queue: &str,
        now_ms: u64,
        limit: usize,
    ) -> TemplateResult<TickOutcome> {
        let mut inner = self.lock();
        let delayed = keys::delayed_key(queue);
        let due = inner.zset(&delayed).due(now_ms, limit);
        for (_, member) in &due {
            inner.zset(&delayed).remove(member);
            inner.lpush(&keys::ready_key(queue), member.clone());
        }
        Ok(TickOutcome {
            moved: due.len(),
            next_due_ms: inner.zset(&delayed).first_score(),
        })
    }

    async fn reap_expired(
        &self,
        descriptor: &QueueDescriptor,
        now_ms: u64,
        limit: usize,
    ) -> TemplateResult<TickOutcome> {
        Ok(self.lock().reap(descriptor, now_ms, limit))
    }

    async fn read_from_list(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> TemplateResult<Vec<Message>> {
        let inner = self.lock();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let (from, to) = range_bounds(list.len(), start, end);
        Ok(list
            .iter()
            .skip(from)
            .take(to - from)
            .filter_map(|member| decode_member(member).ok())
            .collect())
    }

    async fn read_from_zset(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> TemplateResult<Vec<Message>> {
        Ok(self
            .read_from_zset_with_scores(key, start, end)
            .await?
            .into_iter()
            .map(|(message, _)| message)
            .collect())
    }

    async fn read_from_zset_with_scores(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> TemplateResult<Vec<(Message, u64)>> {
        let inner = self.lock();
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let (from, to) = range_bounds(zset.len(), start, end);
        Ok(zset
            .by_score
            .iter()
            .skip(from)
            .take(to - from)
            .filter_map(|(score, member)| {
                decode_member(member).ok().map(|message| (message, *score))
            })
            .collect())
    }

    async fn move_list_to_list(&self, src: &str, dst: &str, limit: usize) -> TemplateResult<usize> {
        let mut inner = self.lock();
        let mut moved = 0;
        while moved < limit {
            let Some(member) = inner.rpop(src) else { break };
            inner.lpush(dst, member);
            moved += 1;
        }
        Ok(moved)
    }

    async fn move_zset_to_list(&self, src: &str, dst: &str, limit: usize) -> TemplateResult<usize> {
        let mut inner = self.lock();
        let members: Vec<String> = inner
            .zset(src)
            .by_score
            .iter()
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect();
        for member in &members {
            inner.zset(src).remove(member);
            inner.lpush(dst, member.clone());
        }
        Ok(members.len())
    }

    async fn move_list_to_zset(
        &self,
        src: &str,
        dst: &str,
        limit: usize,
        score_ms: u64,
    ) -> TemplateResult<usize> {
        let mut inner = self.lock();
        let mut moved = 0;
        while moved < limit {
            let Some(member) = inner.rpop(src) else { break };
            inner.zset(dst).insert(score_ms, member);
            moved += 1;
        }
        Ok(moved)
    }

    async fn move_zset_to_zset(
        &self,
        src: &str,
        dst: &str,
        limit: usize,
        score: ScoreMode,
    ) -> TemplateResult<usize> {
        let mut inner = self.lock();
        let entries: Vec<(u64, String)> = inner
            .zset(src)
            .by_score
            .iter()
            .take(limit)
            .cloned()
            .collect();
        for (old_score, member) in &entries {
            let new_score = match score {
                ScoreMode::Fixed(ms) => ms,
                ScoreMode::Shift(delta) => old_score.saturating_add_signed(delta),
            };
            inner.zset(src).remove(member);
            inner.zset(dst).insert(new_score, member.clone());
        }
        Ok(entries.len())
    }

    async fn size(&self, key: &str) -> TemplateResult<u64> {
        let inner = self.lock();
        if let Some(list) = inner.lists.get(key) {
            if !list.is_empty() {
                return Ok(list.len() as u64);
            }
        }
        Ok(inner.zsets.get(key).map_or(0, |z| z.len() as u64))
    }

    async fn key_type(&self, key: &str) -> TemplateResult<KeyType> {
        let inner = self.lock();
        if inner.lists.get(key).is_some_and(|l| !l.is_empty()) {
            return Ok(KeyType::List);
        }
        if inner.zsets.get(key).is_some_and(|z| z.len() > 0) {
            return Ok(KeyType::Zset);
        }
        Ok(KeyType::None)
    }

    async fn write_queue_config(&self, descriptor: &QueueDescriptor) -> TemplateResult<()> {
        self.lock()
            .configs
            .insert(descriptor.name.clone(), descriptor.clone());
        Ok(())
    }

    async fn read_queue_config(&self, queue: &str) -> TemplateResult<Option<QueueDescriptor>> {
        Ok(self.lock().configs.get(queue).cloned())
    }
}
