use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::config::ContainerConfig;
use super::sleep_or_stop;
use crate::template::{epoch_ms, MessageTemplate};

/// Per-queue promotion loop: moves due messages from the delayed set into
/// the ready list. Only launched for queues registered as delayed.
///
/// The sleep adapts to the earliest remaining score, clamped between the
/// configured floor and ceiling so near-due floods do not spin the loop and
/// far-future messages do not stall shutdown.
pub(super) async fn run(
    template: Arc<dyn MessageTemplate>,
    queue: String,
    config: ContainerConfig,
    mut stop: watch::Receiver<bool>,
) {
    info!(%queue, "scheduler started");
    while !*stop.borrow() {
        let now = epoch_ms();
        match template
            .promote_due(&queue, now, config.drain_batch_size)
            .await
        {
            Ok(outcome) => {
                if outcome.moved > 0 {
                    debug!(%queue, promoted = outcome.moved, "promoted due messages");
                }
                // A full batch means more may already be due.
                if outcome.moved == config.drain_batch_size {
                    continue;
                }
                let sleep_ms = outcome
                    .next_due_ms
                    .map(|due| due.saturating_sub(now))
                    .unwrap_or(config.tick_ceiling_ms)
                    .clamp(config.tick_floor_ms, config.tick_ceiling_ms);
                if sleep_or_stop(&mut stop, Duration::from_millis(sleep_ms)).await {
                    break;
                }
            }
            Err(e) => {
                warn!(%queue, error = %e, "promotion failed, backing off");
                if sleep_or_stop(&mut stop, Duration::from_millis(config.back_off_time_ms)).await {
                    break;
                }
            }
        }
    }
    info!(%queue, "scheduler stopped");
}
