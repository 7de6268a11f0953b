use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{ConfigError, HandlerError};
use crate::message::Message;
use crate::queue::QueueDescriptor;

/// User callback invoked for each delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// `value` is the payload after the converter chain. Returning an error
    /// drives the retry/DLQ state machine.
    async fn handle(&self, message: Message, value: Value) -> Result<(), HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, message: Message, value: Value) -> Result<(), HandlerError> {
        (self.0)(message, value).await
    }
}

/// Wrap an async closure as a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// A queue's consumption policy plus its handler.
#[derive(Clone)]
pub struct QueueRegistration {
    pub descriptor: QueueDescriptor,
    pub handler: Arc<dyn MessageHandler>,
}

/// Maps queue names to registrations. Mutable only before the container
/// starts; the container takes it behind an `Arc` and it stays frozen for
/// the broker's lifetime.
#[derive(Default)]
pub struct HandlerRegistry {
    entries: HashMap<String, QueueRegistration>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a queue. The descriptor must validate and the
    /// name must be unused.
    pub fn register(
        &mut self,
        descriptor: QueueDescriptor,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConfigError> {
        if !descriptor.is_valid() {
            return Err(ConfigError::InvalidDescriptor(
                descriptor.name.clone(),
                "empty name or visibility timeout below the minimum".to_string(),
            ));
        }
        if self.entries.contains_key(&descriptor.name) {
            return Err(ConfigError::DuplicateQueue(descriptor.name));
        }
        self.entries.insert(
            descriptor.name.clone(),
            QueueRegistration {
                descriptor,
                handler,
            },
        );
        Ok(())
    }

    pub fn get(&self, queue: &str) -> Option<&QueueRegistration> {
        self.entries.get(queue)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &QueueDescriptor> {
        self.entries.values().map(|r| &r.descriptor)
    }

    pub fn registrations(&self) -> impl Iterator<Item = &QueueRegistration> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `queue` was registered as delayed. Property of the
    /// registration, unlike [`is_dead_letter_queue`](Self::is_dead_letter_queue)
    /// which is a name-based lookup across all registrations.
    pub fn is_delayed_queue(&self, queue: &str) -> bool {
        self.entries.get(queue).is_some_and(|r| r.descriptor.delayed)
    }

    /// Whether `name` is a dead-letter destination of any registered queue.
    pub fn is_dead_letter_queue(&self, name: &str) -> bool {
        self.entries
            .values()
            .any(|r| r.descriptor.dead_letter_queues.contains(name))
    }
}
