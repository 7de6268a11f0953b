use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use super::outcome::{post_process, ExecutionOutcome};
use crate::codec::ConverterChain;
use crate::processor::MessageProcessor;
use crate::registry::QueueRegistration;
use crate::template::{Delivery, MessageTemplate};

/// Everything a worker needs to execute and settle one message. One context
/// per queue, shared by all of that queue's workers.
pub(super) struct WorkerContext {
    pub(super) template: Arc<dyn MessageTemplate>,
    pub(super) registration: QueueRegistration,
    pub(super) converters: ConverterChain,
    pub(super) discard_processor: Arc<dyn MessageProcessor>,
    pub(super) dlq_processor: Arc<dyn MessageProcessor>,
    pub(super) back_off_time_ms: u64,
    /// Runtime that worker tasks are spawned onto.
    pub(super) executor: tokio::runtime::Handle,
}

/// Run one handler invocation and report the outcome to the state machine.
/// Holds its pool permit for the whole execution.
pub(super) async fn execute(
    ctx: Arc<WorkerContext>,
    delivery: Delivery,
    _permit: OwnedSemaphorePermit,
) {
    let outcome = invoke_handler(&ctx, &delivery).await;
    post_process(&ctx, delivery, outcome).await;
}

async fn invoke_handler(ctx: &WorkerContext, delivery: &Delivery) -> ExecutionOutcome {
    let descriptor = &ctx.registration.descriptor;
    debug!(
        queue = %descriptor.name,
        message_id = %delivery.message.id,
        retry_count = delivery.message.retry_count,
        "executing handler"
    );

    // A payload that does not decode never will: skip the retry budget.
    let value = match ctx.converters.decode(&delivery.message.payload) {
        Ok(value) => value,
        Err(e) => return ExecutionOutcome::TerminalFailure(format!("payload decode: {e}")),
    };

    let deadline = Duration::from_millis(descriptor.handler_deadline_ms());
    let handler = ctx.registration.handler.clone();
    let message = delivery.message.clone();
    match tokio::time::timeout(deadline, handler.handle(message, value)).await {
        Ok(Ok(())) => ExecutionOutcome::Success,
        Ok(Err(e)) => ExecutionOutcome::Failure(e),
        Err(_) => ExecutionOutcome::DeadlineExceeded,
    }
}
