//! Retry policy: error classification and backoff schedule.

use std::time::Duration;

use crate::config::BackoffConfig;
use crate::engine::handlers::ExecutionError;

/// Whether a failed execution is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network, timeout, rate-limit and server-side failures. Retryable.
    Transient,
    /// Authentication and validation failures. Retrying cannot help.
    Permanent,
}

/// Classify an execution error against the fixed taxonomy.
pub fn classify(error: &ExecutionError) -> ErrorClass {
    match error {
        ExecutionError::Timeout
        | ExecutionError::Network(_)
        | ExecutionError::RateLimited
        | ExecutionError::Upstream { .. } => ErrorClass::Transient,
        ExecutionError::Auth(_)
        | ExecutionError::InvalidPayload(_)
        | ExecutionError::Render(_)
        | ExecutionError::UnknownJobType(_) => ErrorClass::Permanent,
    }
}

/// Backoff schedule for transient failures.
///
/// Deterministic and monotonically non-decreasing: `base * multiplier^n`,
/// capped at `max`. No jitter, so tests can assert exact schedules.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base: Duration,
    multiplier: f64,
    max: Duration,
}

impl RetryPolicy {
    pub fn new(config: &BackoffConfig) -> Self {
        Self {
            base: Duration::from_secs(config.base_secs),
            multiplier: config.multiplier.max(1.0),
            max: Duration::from_secs(config.max_secs.max(config.base_secs)),
        }
    }

    /// Delay before re-dispatching after `attempt` consumed attempts
    /// (0-indexed: the first retry waits `backoff(0)`).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(63) as i32);
        let delay = self.base.as_secs_f64() * factor;
        if delay >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(delay)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&BackoffConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base: u64, multiplier: f64, max: u64) -> RetryPolicy {
        RetryPolicy::new(&BackoffConfig {
            base_secs: base,
            multiplier,
            max_secs: max,
        })
    }

    #[test]
    fn test_backoff_schedule_is_exact() {
        let policy = policy(30, 2.0, 3600);
        assert_eq!(policy.backoff(0), Duration::from_secs(30));
        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(3), Duration::from_secs(240));
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let policy = policy(30, 2.0, 120);
        assert_eq!(policy.backoff(5), Duration::from_secs(120));
        assert_eq!(policy.backoff(40), Duration::from_secs(120));
    }

    #[test]
    fn test_backoff_non_decreasing() {
        let policy = policy(10, 1.7, 900);
        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let delay = policy.backoff(attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            previous = delay;
        }
    }

    #[test]
    fn test_classification_table() {
        assert_eq!(classify(&ExecutionError::Timeout), ErrorClass::Transient);
        assert_eq!(
            classify(&ExecutionError::Network("connection reset".into())),
            ErrorClass::Transient
        );
        assert_eq!(classify(&ExecutionError::RateLimited), ErrorClass::Transient);
        assert_eq!(
            classify(&ExecutionError::Upstream { status: 503 }),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ExecutionError::Auth("bad key".into())),
            ErrorClass::Permanent
        );
        assert_eq!(
            classify(&ExecutionError::InvalidPayload("missing prompt".into())),
            ErrorClass::Permanent
        );
    }
}
