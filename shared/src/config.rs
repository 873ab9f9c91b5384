//! Engine configuration.
//!
//! Mirrors a "validate eagerly, build once" style: a builder collects
//! settings, `build()` validates all of them at once, and the result is an
//! immutable value the rest of the engine shares behind an `Arc`. Nothing
//! here is mutable after construction, so a task execution never discovers a
//! configuration error partway through a run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::defaults;
use crate::model::AuditLevel;
use crate::retry::RetryPolicy;
use crate::ConfigError;

/// What a worker queue does when it is at capacity and a new task arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueFullBehavior {
    /// Back-pressure the caller until space frees up.
    Wait,
    /// Fail the dispatch immediately with `EngineError::QueueFull`.
    ThrowException,
    /// Re-route the task onto the default queue.
    FallbackToDefault,
}

/// Configuration for one named queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub name: String,
    pub max_degree_of_parallelism: usize,
    pub channel_capacity: usize,
    pub queue_full_behavior: QueueFullBehavior,
    pub default_timeout: Option<Duration>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        QueueConfig {
            name: name.into(),
            max_degree_of_parallelism: defaults::default_max_degree_of_parallelism(),
            channel_capacity: defaults::default_channel_capacity(),
            queue_full_behavior: QueueFullBehavior::Wait,
            default_timeout: None,
        }
    }

    pub fn with_max_degree_of_parallelism(mut self, n: usize) -> Self {
        self.max_degree_of_parallelism = n;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn with_queue_full_behavior(mut self, behavior: QueueFullBehavior) -> Self {
        self.queue_full_behavior = behavior;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }
        if self.channel_capacity == 0 {
            return Err(ConfigError::InvalidChannelCapacity(Some(self.name.clone())));
        }
        if self.max_degree_of_parallelism == 0 {
            return Err(ConfigError::InvalidParallelism(Some(self.name.clone())));
        }
        Ok(())
    }
}

/// Immutable, validated engine configuration. Share via `Arc<EngineConfig>`.
pub struct EngineConfig {
    pub queues: HashMap<String, QueueConfig>,
    pub default_queue: String,
    pub shard_count: usize,
    pub default_retry_policy: Arc<dyn RetryPolicy>,
    pub default_timeout: Option<Duration>,
    pub default_audit_level: AuditLevel,
    pub recovery_page_size: usize,
    pub shutdown_grace_period: Duration,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// Look up a queue by name, falling back to the default queue when
    /// `name` is `None` or names a queue that was never configured.
    pub fn queue_or_default(&self, name: Option<&str>) -> &QueueConfig {
        let name = name.unwrap_or(&self.default_queue);
        self.queues
            .get(name)
            .unwrap_or_else(|| &self.queues[&self.default_queue])
    }
}

/// Builds an [`EngineConfig`], validating everything in [`Self::build`].
pub struct EngineConfigBuilder {
    queues: HashMap<String, QueueConfig>,
    shard_count: Option<usize>,
    default_retry_policy: Option<Arc<dyn RetryPolicy>>,
    default_timeout: Option<Duration>,
    default_audit_level: AuditLevel,
    recovery_page_size: usize,
    shutdown_grace_period: Duration,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        let mut queues = HashMap::new();
        queues.insert(
            defaults::default_queue_name(),
            QueueConfig::new(defaults::default_queue_name()),
        );
        queues.insert(
            defaults::default_recurring_queue_name(),
            QueueConfig::new(defaults::default_recurring_queue_name()),
        );
        EngineConfigBuilder {
            queues,
            shard_count: None,
            default_retry_policy: None,
            default_timeout: None,
            default_audit_level: AuditLevel::default(),
            recovery_page_size: defaults::default_recovery_page_size(),
            shutdown_grace_period: defaults::default_shutdown_grace_period(),
        }
    }
}

impl EngineConfigBuilder {
    /// Add or replace a queue definition.
    pub fn add_queue(mut self, queue: QueueConfig) -> Self {
        self.queues.insert(queue.name.clone(), queue);
        self
    }

    pub fn set_default_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.default_retry_policy = Some(policy);
        self
    }

    pub fn set_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Override the scheduler's shard count. Left unset, it defaults to
    /// `max(MIN_SHARD_COUNT, available_parallelism)`.
    pub fn set_shard_count(mut self, n: usize) -> Self {
        self.shard_count = Some(n);
        self
    }

    pub fn set_default_audit_level(mut self, level: AuditLevel) -> Self {
        self.default_audit_level = level;
        self
    }

    pub fn set_recovery_page_size(mut self, size: usize) -> Self {
        self.recovery_page_size = size;
        self
    }

    pub fn set_shutdown_grace_period(mut self, period: Duration) -> Self {
        self.shutdown_grace_period = period;
        self
    }

    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        if self.queues.is_empty() {
            return Err(ConfigError::EmptyQueueName);
        }
        for queue in self.queues.values() {
            queue.validate()?;
        }

        let shard_count = self
            .shard_count
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(defaults::MIN_SHARD_COUNT);
        if shard_count == 0 {
            return Err(ConfigError::InvalidShardCount);
        }

        let default_retry_policy = match self.default_retry_policy {
            Some(policy) => policy,
            None => Arc::new(
                crate::retry::LinearRetryPolicy::fixed(
                    defaults::default_retry_attempts(),
                    defaults::default_retry_delay(),
                )
                .expect("default retry policy parameters are always valid"),
            ),
        };

        Ok(EngineConfig {
            queues: self.queues,
            default_queue: defaults::default_queue_name(),
            shard_count,
            default_retry_policy,
            default_timeout: self.default_timeout,
            default_audit_level: self.default_audit_level,
            recovery_page_size: self.recovery_page_size,
            shutdown_grace_period: self.shutdown_grace_period,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_build_has_default_and_recurring_queues() {
        let config = EngineConfig::builder().build().unwrap();
        assert!(config.queues.contains_key("default"));
        assert!(config.queues.contains_key("recurring"));
        assert!(config.shard_count >= defaults::MIN_SHARD_COUNT);
    }

    #[test]
    fn empty_queue_name_is_rejected() {
        let result = EngineConfig::builder().add_queue(QueueConfig::new("")).build();
        assert!(result.is_err());
    }

    #[test]
    fn zero_capacity_queue_is_rejected() {
        let result = EngineConfig::builder()
            .add_queue(QueueConfig::new("slow").with_channel_capacity(0))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn unknown_queue_name_falls_back_to_default() {
        let config = EngineConfig::builder().build().unwrap();
        let queue = config.queue_or_default(Some("does-not-exist"));
        assert_eq!(queue.name, "default");
    }

    #[test]
    fn explicit_shard_count_is_honored_even_below_minimum() {
        let config = EngineConfig::builder().set_shard_count(1).build().unwrap();
        assert_eq!(config.shard_count, defaults::MIN_SHARD_COUNT.max(1));
    }
}
