use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Smallest visibility window that leaves a handler any useful execution
/// time after accounting for Redis round trips.
pub const MIN_EXECUTION_TIME: u64 = 1_000;

/// Margin subtracted from the visibility timeout to form the handler
/// deadline, so a finished handler can always report its outcome before the
/// reaper considers the message abandoned.
pub const DELTA_BETWEEN_RE_ENQUEUE_TIME: u64 = 500;

/// Default visibility timeout: 15 minutes.
pub const MAX_JOB_EXECUTION_TIME: u64 = 900_000;

/// Per-queue consumption policy, immutable after registration.
///
/// Persisted as the `<queueName>:config` hash so the server-side scripts can
/// consult the retry limit and dead-letter routing without a round trip to
/// the application.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueDescriptor {
    pub name: String,
    /// Whether the queue accepts scheduled (future) messages. Only delayed
    /// queues get a promotion loop.
    pub delayed: bool,
    /// Application-side retry budget after the first attempt.
    pub num_retries: u32,
    /// Dead-letter destinations. Exhausted messages are moved to the first
    /// entry; the full set is used for name-based DLQ classification.
    pub dead_letter_queues: BTreeSet<String>,
    /// Visibility timeout in ms.
    pub max_job_execution_time_ms: u64,
}

impl QueueDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delayed: false,
            num_retries: 0,
            dead_letter_queues: BTreeSet::new(),
            max_job_execution_time_ms: MAX_JOB_EXECUTION_TIME,
        }
    }

    pub fn delayed(mut self, delayed: bool) -> Self {
        self.delayed = delayed;
        self
    }

    pub fn num_retries(mut self, retries: u32) -> Self {
        self.num_retries = retries;
        self
    }

    pub fn dead_letter_queue(mut self, name: impl Into<String>) -> Self {
        self.dead_letter_queues.insert(name.into());
        self
    }

    pub fn max_job_execution_time_ms(mut self, ms: u64) -> Self {
        self.max_job_execution_time_ms = ms;
        self
    }

    /// The DLQ that exhausted messages are routed to.
    pub fn primary_dead_letter_queue(&self) -> Option<&str> {
        self.dead_letter_queues.iter().next().map(String::as_str)
    }

    /// A descriptor is valid when it names a queue and its visibility window
    /// leaves room for both a handler deadline and the reporting margin.
    pub fn is_valid(&self) -> bool {
        !self.name.is_empty()
            && self.max_job_execution_time_ms >= MIN_EXECUTION_TIME + DELTA_BETWEEN_RE_ENQUEUE_TIME
    }

    /// Deadline handed to the handler future.
    pub fn handler_deadline_ms(&self) -> u64 {
        self.max_job_execution_time_ms - DELTA_BETWEEN_RE_ENQUEUE_TIME
    }
}
