use async_trait::async_trait;

use crate::message::Message;

/// Hook invoked at terminal message transitions: discard (retries exhausted,
/// no DLQ) and dead-letter moves. Fire-and-log — a failing hook never
/// affects the message's fate.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &Message);
}

/// Default hook that does nothing.
pub struct NoOpMessageProcessor;

#[async_trait]
impl MessageProcessor for NoOpMessageProcessor {
    async fn process(&self, _message: &Message) {}
}
