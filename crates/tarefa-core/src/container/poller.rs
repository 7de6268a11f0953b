use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use super::config::ContainerConfig;
use super::sleep_or_stop;
use super::worker::{self, WorkerContext};

/// Per-queue poller: moves ready messages into the processing set and hands
/// them to the worker pool. There is no in-memory buffer between the poller
/// and the pool — when every slot is busy the poller waits on admission and
/// the processing set holds the in-flight messages.
pub(super) async fn run(
    ctx: Arc<WorkerContext>,
    pool: Arc<Semaphore>,
    config: ContainerConfig,
    mut stop: watch::Receiver<bool>,
) {
    let queue = ctx.registration.descriptor.name.clone();
    let visibility_ms = ctx.registration.descriptor.max_job_execution_time_ms;
    info!(%queue, "poller started");
    while !*stop.borrow() {
        match ctx.template.pop_ready(&queue, visibility_ms).await {
            Ok(Some(delivery)) => {
                let permit = tokio::select! {
                    permit = pool.clone().acquire_owned() => permit,
                    _ = stop.changed() => {
                        // In-flight message stays in the processing set; the
                        // reaper recovers it after the visibility deadline.
                        break;
                    }
                };
                match permit {
                    Ok(permit) => {
                        ctx.executor
                            .spawn(worker::execute(ctx.clone(), delivery, permit));
                    }
                    Err(_) => break,
                }
            }
            Ok(None) => {
                if sleep_or_stop(&mut stop, Duration::from_millis(config.poll_interval_ms)).await {
                    break;
                }
            }
            Err(e) => {
                warn!(%queue, error = %e, "poll failed, backing off");
                if sleep_or_stop(&mut stop, Duration::from_millis(config.back_off_time_ms)).await {
                    break;
                }
            }
        }
    }
    info!(%queue, "poller stopped");
}
