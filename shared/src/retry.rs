//! Retry policy contract.
//!
//! A [`RetryPolicy`] decides, for a failed handler attempt, whether another
//! attempt should be made and how long to wait first. It only ever sees
//! handler failures — cancellation and timeout are never routed through
//! `should_retry` at all, so "never retried even if whitelisted" is a
//! structural guarantee of the caller (the executor), not a rule every policy
//! has to remember to enforce.

use std::time::Duration;

use crate::ConfigError;

/// Per-attempt delay schedule.
#[derive(Debug, Clone)]
enum DelaySpec {
    Fixed(Duration),
    PerAttempt(Vec<Duration>),
}

/// Decides whether a handler failure should be retried.
///
/// Built with [`RetryFilter::all`] (the default — retry everything), a
/// whitelist (`handle::<T>()`), a blacklist (`do_not_handle::<T>()`), or a
/// predicate (`handle_when(..)`, which takes precedence over the other two if
/// somehow both are present). Whitelist and blacklist are mutually exclusive.
pub struct RetryFilter {
    whitelist: Vec<Box<dyn Fn(&anyhow::Error) -> bool + Send + Sync>>,
    blacklist: Vec<Box<dyn Fn(&anyhow::Error) -> bool + Send + Sync>>,
    predicate: Option<Box<dyn Fn(&anyhow::Error) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for RetryFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryFilter")
            .field("whitelist_len", &self.whitelist.len())
            .field("blacklist_len", &self.blacklist.len())
            .field("has_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Default for RetryFilter {
    fn default() -> Self {
        RetryFilter {
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            predicate: None,
        }
    }
}

impl RetryFilter {
    /// Retry every handler failure. The default.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only retry when the root cause downcasts to `T`.
    pub fn handle<T>(mut self) -> Result<Self, ConfigError>
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        if !self.blacklist.is_empty() {
            return Err(ConfigError::MixedRetryFilter);
        }
        self.whitelist
            .push(Box::new(|err: &anyhow::Error| err.downcast_ref::<T>().is_some()));
        Ok(self)
    }

    /// Retry everything except when the root cause downcasts to `T`.
    pub fn do_not_handle<T>(mut self) -> Result<Self, ConfigError>
    where
        T: std::error::Error + Send + Sync + 'static,
    {
        if !self.whitelist.is_empty() {
            return Err(ConfigError::MixedRetryFilter);
        }
        self.blacklist
            .push(Box::new(|err: &anyhow::Error| err.downcast_ref::<T>().is_some()));
        Ok(self)
    }

    /// A custom predicate. If set, takes precedence over any whitelist or
    /// blacklist entries also configured on this filter.
    pub fn handle_when(
        mut self,
        predicate: impl Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Box::new(predicate));
        self
    }

    fn should_retry(&self, error: &anyhow::Error) -> bool {
        if let Some(predicate) = &self.predicate {
            return predicate(error);
        }
        if !self.whitelist.is_empty() {
            return self.whitelist.iter().any(|matches| matches(error));
        }
        if !self.blacklist.is_empty() {
            return !self.blacklist.iter().any(|matches| matches(error));
        }
        true
    }
}

/// Decides whether, when, and how many times to retry a failed handler
/// attempt.
pub trait RetryPolicy: Send + Sync {
    /// Total attempt budget, including the first attempt.
    fn max_attempts(&self) -> u32;

    /// Delay to wait before attempt number `attempt` (1-indexed: the delay
    /// before the *second* attempt is `delay_for(1)`).
    fn delay_for(&self, attempt: u32) -> Duration;

    /// Whether a handler failure should be retried. Never consulted for
    /// cancellation or timeout — the executor filters those out first.
    fn should_retry(&self, error: &anyhow::Error) -> bool;
}

/// Reference retry policy: a fixed attempt budget with either one fixed delay
/// or a distinct delay per attempt, filtered by a [`RetryFilter`].
pub struct LinearRetryPolicy {
    max_attempts: u32,
    delay: DelaySpec,
    filter: RetryFilter,
}

impl LinearRetryPolicy {
    /// `max_attempts` total attempts, each followed by the same `delay` if it
    /// fails and another attempt remains.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Result<Self, ConfigError> {
        if max_attempts == 0 {
            return Err(ConfigError::ZeroRetryAttempts);
        }
        Ok(LinearRetryPolicy {
            max_attempts,
            delay: DelaySpec::Fixed(delay),
            filter: RetryFilter::all(),
        })
    }

    /// One delay per retry (not counting the first attempt): `delays.len()`
    /// retries, so `delays.len() + 1` total attempts.
    pub fn per_attempt(delays: Vec<Duration>) -> Result<Self, ConfigError> {
        if delays.is_empty() {
            return Err(ConfigError::ZeroRetryAttempts);
        }
        let max_attempts = delays.len() as u32 + 1;
        Ok(LinearRetryPolicy {
            max_attempts,
            delay: DelaySpec::PerAttempt(delays),
            filter: RetryFilter::all(),
        })
    }

    pub fn with_filter(mut self, filter: RetryFilter) -> Self {
        self.filter = filter;
        self
    }
}

impl RetryPolicy for LinearRetryPolicy {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        match &self.delay {
            DelaySpec::Fixed(d) => *d,
            DelaySpec::PerAttempt(delays) => {
                let idx = (attempt.saturating_sub(1)) as usize;
                delays.get(idx).copied().unwrap_or_default()
            }
        }
    }

    fn should_retry(&self, error: &anyhow::Error) -> bool {
        self.filter.should_retry(error)
    }
}
