use tracing::{debug, error, warn};

use super::worker::WorkerContext;
use crate::error::HandlerError;
use crate::template::{epoch_ms, Delivery};

/// What happened to one handler invocation.
#[derive(Debug)]
pub(super) enum ExecutionOutcome {
    Success,
    /// Handler returned an error; the retry budget decides what happens.
    Failure(HandlerError),
    /// Not retryable regardless of budget (e.g. the payload does not
    /// decode — it never will).
    TerminalFailure(String),
    /// Handler exceeded its deadline. The message stays in the processing
    /// set; the reaper rediscovers it at the visibility deadline and counts
    /// it as a retry.
    DeadlineExceeded,
}

/// The retry/DLQ state machine. This is the only application-side path that
/// advances a message's retry count (the template does the actual increment
/// server-side, so it cannot race the reaper).
pub(super) async fn post_process(ctx: &WorkerContext, delivery: Delivery, outcome: ExecutionOutcome) {
    let queue = &ctx.registration.descriptor.name;
    match outcome {
        ExecutionOutcome::Success => {
            if let Err(e) = ctx.template.ack_processing(queue, &delivery).await {
                warn!(%queue, message_id = %delivery.message.id, error = %e, "ack failed");
            }
        }
        ExecutionOutcome::DeadlineExceeded => {
            warn!(
                %queue,
                message_id = %delivery.message.id,
                "handler exceeded its deadline, leaving message for the reaper"
            );
        }
        ExecutionOutcome::Failure(e) => {
            let descriptor = &ctx.registration.descriptor;
            let budget = delivery
                .message
                .effective_retries(descriptor.num_retries);
            if delivery.message.retry_count < budget {
                retry(ctx, delivery, &e.to_string()).await;
            } else {
                exhaust(ctx, delivery, &e.to_string()).await;
            }
        }
        ExecutionOutcome::TerminalFailure(reason) => {
            exhaust(ctx, delivery, &reason).await;
        }
    }
}

/// Failure with budget remaining: back into the queue. Delayed queues park
/// the message in the delayed set for `back_off_time_ms`; queues without a
/// promotion loop go straight back to the ready list.
async fn retry(ctx: &WorkerContext, delivery: Delivery, reason: &str) {
    let descriptor = &ctx.registration.descriptor;
    let queue = &descriptor.name;
    let delay_ms = if descriptor.delayed {
        ctx.back_off_time_ms
    } else {
        0
    };
    match ctx.template.re_enqueue(queue, &delivery, delay_ms).await {
        Ok(true) => debug!(
            %queue,
            message_id = %delivery.message.id,
            retry = delivery.message.retry_count + 1,
            delay_ms,
            %reason,
            "message re-enqueued for retry"
        ),
        Ok(false) => debug!(
            %queue,
            message_id = %delivery.message.id,
            "message already recovered by the reaper"
        ),
        Err(e) => warn!(%queue, message_id = %delivery.message.id, error = %e, "re-enqueue failed"),
    }
}

/// Budget exhausted (or the failure is terminal): dead-letter when a DLQ is
/// configured, otherwise remove the message and notify the discard hook.
async fn exhaust(ctx: &WorkerContext, delivery: Delivery, reason: &str) {
    let descriptor = &ctx.registration.descriptor;
    let queue = &descriptor.name;
    match descriptor.primary_dead_letter_queue() {
        Some(dlq) => {
            let moved = ctx.template.move_to_dlq(queue, dlq, &delivery).await;
            match moved {
                Ok(true) => {
                    error!(
                        %queue,
                        message_id = %delivery.message.id,
                        %dlq,
                        %reason,
                        "message moved to dead-letter queue"
                    );
                    let mut message = delivery.message;
                    message.re_enqueued_at = Some(epoch_ms());
                    ctx.dlq_processor.process(&message).await;
                }
                Ok(false) => debug!(
                    %queue,
                    message_id = %delivery.message.id,
                    "message already recovered by the reaper"
                ),
                Err(e) => {
                    warn!(%queue, message_id = %delivery.message.id, error = %e, "DLQ move failed")
                }
            }
        }
        None => {
            if let Err(e) = ctx.template.ack_processing(queue, &delivery).await {
                warn!(%queue, message_id = %delivery.message.id, error = %e, "discard ack failed");
                return;
            }
            error!(
                %queue,
                message_id = %delivery.message.id,
                %reason,
                "message discarded after exhausting retries"
            );
            ctx.discard_processor.process(&delivery.message).await;
        }
    }
}
