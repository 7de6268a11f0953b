use serde::Deserialize;

/// Container tuning knobs, deserializable from TOML.
///
/// Queue policy (retries, DLQ, visibility) lives on each
/// [`QueueDescriptor`](crate::queue::QueueDescriptor); this struct only
/// carries process-wide behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Start the container as soon as the composition root asks for it.
    pub auto_startup: bool,
    /// Worker pool size. `None` uses one slot per registered queue.
    pub max_num_workers: Option<usize>,
    /// Sleep after an infrastructure error before a loop resumes.
    pub back_off_time_ms: u64,
    /// Poller sleep when the ready list is empty.
    pub poll_interval_ms: u64,
    /// Lower bound for scheduler/reaper adaptive sleeps, so a flood of
    /// near-due messages does not spin the loop.
    pub tick_floor_ms: u64,
    /// Upper bound for scheduler/reaper adaptive sleeps.
    pub tick_ceiling_ms: u64,
    /// Members moved per scheduler/reaper pass.
    pub drain_batch_size: usize,
    /// How long `stop()` waits for loops and in-flight handlers before
    /// abandoning them to visibility recovery.
    pub shutdown_grace_ms: u64,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            auto_startup: true,
            max_num_workers: None,
            back_off_time_ms: 10_000,
            poll_interval_ms: 500,
            tick_floor_ms: 5,
            tick_ceiling_ms: 100,
            drain_batch_size: 64,
            shutdown_grace_ms: 30_000,
        }
    }
}
