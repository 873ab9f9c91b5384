//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the configuration
//! structures. These functions are used by serde when deserializing configuration
//! that doesn't specify certain optional fields, and by `EngineConfig::builder()`
//! when a caller leaves a knob unset.

/// Name of the queue a task lands on when no queue is configured.
pub fn default_queue_name() -> String {
    "default".to_string()
}

/// Name of the queue a recurring task lands on when no queue is configured.
pub fn default_recurring_queue_name() -> String {
    "recurring".to_string()
}

/// Default bounded-channel capacity for a worker queue.
pub fn default_channel_capacity() -> usize {
    1000
}

/// Default number of concurrent handler invocations per queue.
pub fn default_max_degree_of_parallelism() -> usize {
    4
}

/// Default number of scheduler shards when the host doesn't override it.
///
/// `max(4, num_cpus)`, evaluated lazily by the config builder rather than here
/// so the default stays a plain constant for tests.
pub const MIN_SHARD_COUNT: usize = 4;

/// Upper bound on a single scheduler sleep, so a shard re-checks its heap
/// periodically even under clock skew or a missed wake-up.
pub fn max_scheduler_sleep() -> std::time::Duration {
    std::time::Duration::from_secs(90 * 60)
}

/// Default graceful shutdown grace period.
pub fn default_shutdown_grace_period() -> std::time::Duration {
    std::time::Duration::from_secs(30)
}

/// Default number of rows fetched per recovery page.
pub fn default_recovery_page_size() -> usize {
    200
}

/// Default retry attempt budget when a handler declares no policy and the
/// engine has no override configured either.
pub fn default_retry_attempts() -> u32 {
    3
}

/// Default fixed delay between retry attempts.
pub fn default_retry_delay() -> std::time::Duration {
    std::time::Duration::from_millis(500)
}
