use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use crate::codec::ConverterChain;
use crate::error::EnqueueError;
use crate::message::Message;
use crate::registry::HandlerRegistry;
use crate::template::{epoch_ms, MessageTemplate};

/// Producer-side API. Encodes values through the converter chain and hands
/// them to the template; the template decides between the ready list and the
/// delayed set.
///
/// The sender is `Clone` and can be shared across tasks.
#[derive(Clone)]
pub struct MessageSender {
    template: Arc<dyn MessageTemplate>,
    registry: Arc<HandlerRegistry>,
    converters: ConverterChain,
}

impl MessageSender {
    pub fn new(
        template: Arc<dyn MessageTemplate>,
        registry: Arc<HandlerRegistry>,
        converters: ConverterChain,
    ) -> Self {
        Self {
            template,
            registry,
            converters,
        }
    }

    /// Enqueue for immediate delivery.
    pub async fn enqueue(&self, queue: &str, value: &Value) -> Result<Uuid, EnqueueError> {
        self.send(queue, value, 0, None).await
    }

    /// Enqueue for delivery at `at_ms` (ms since epoch). The queue must be
    /// registered as delayed.
    pub async fn enqueue_at(
        &self,
        queue: &str,
        value: &Value,
        at_ms: u64,
    ) -> Result<Uuid, EnqueueError> {
        self.require_delayed(queue)?;
        self.send(queue, value, at_ms, None).await
    }

    /// Enqueue for delivery after `delay`. The queue must be registered as
    /// delayed.
    pub async fn enqueue_in(
        &self,
        queue: &str,
        value: &Value,
        delay: Duration,
    ) -> Result<Uuid, EnqueueError> {
        self.require_delayed(queue)?;
        let at_ms = epoch_ms() + delay.as_millis() as u64;
        self.send(queue, value, at_ms, None).await
    }

    /// Enqueue with a per-message retry budget overriding the queue policy.
    pub async fn enqueue_with_retry(
        &self,
        queue: &str,
        value: &Value,
        retries: u32,
    ) -> Result<Uuid, EnqueueError> {
        self.send(queue, value, 0, Some(retries)).await
    }

    async fn send(
        &self,
        queue: &str,
        value: &Value,
        process_at: u64,
        max_retries: Option<u32>,
    ) -> Result<Uuid, EnqueueError> {
        if self.registry.get(queue).is_none() {
            return Err(EnqueueError::UnknownQueue(queue.to_string()));
        }
        let payload = self.converters.encode(value)?;
        let mut message = Message::new(queue, payload, process_at, epoch_ms());
        message.max_retries = max_retries;
        let id = message.id;
        self.template.enqueue(queue, &message).await?;
        debug!(%queue, message_id = %id, process_at, "message enqueued");
        Ok(id)
    }

    fn require_delayed(&self, queue: &str) -> Result<(), EnqueueError> {
        if self.registry.get(queue).is_none() {
            return Err(EnqueueError::UnknownQueue(queue.to_string()));
        }
        if !self.registry.is_delayed_queue(queue) {
            return Err(EnqueueError::NotDelayed(queue.to_string()));
        }
        Ok(())
    }
}
