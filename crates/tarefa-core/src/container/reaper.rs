use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::ContainerConfig;
use super::sleep_or_stop;
use crate::queue::QueueDescriptor;
use crate::template::{epoch_ms, MessageTemplate};

/// Per-queue visibility-timeout recovery loop. Treats the processing set as
/// a min-heap keyed by deadline and returns expired messages to the ready
/// list; every reaped message consumes a retry attempt, and exhausted ones
/// are routed to the DLQ (or dropped) inside the same template operation.
pub(super) async fn run(
    template: Arc<dyn MessageTemplate>,
    descriptor: QueueDescriptor,
    config: ContainerConfig,
    mut stop: watch::Receiver<bool>,
) {
    let queue = descriptor.name.clone();
    info!(%queue, "reaper started");
    while !*stop.borrow() {
        let now = epoch_ms();
        match template
            .reap_expired(&descriptor, now, config.drain_batch_size)
            .await
        {
            Ok(outcome) => {
                if outcome.moved > 0 {
                    debug!(%queue, reaped = outcome.moved, "recovered expired messages");
                }
                if outcome.moved == config.drain_batch_size {
                    continue;
                }
                let sleep_ms = outcome
                    .next_due_ms
                    .map(|deadline| deadline.saturating_sub(now))
                    .unwrap_or(config.tick_ceiling_ms)
                    .clamp(config.tick_floor_ms, config.tick_ceiling_ms);
                if sleep_or_stop(&mut stop, Duration::from_millis(sleep_ms)).await {
                    break;
                }
            }
            Err(e) => {
                warn!(%queue, error = %e, "reap failed, backing off");
                if sleep_or_stop(&mut stop, Duration::from_millis(config.back_off_time_ms)).await {
                    break;
                }
            }
        }
    }
    info!(%queue, "reaper stopped");
}
