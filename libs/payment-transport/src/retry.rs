//! Attempt loop around [`RequestExecutor::execute`].
//!
//! Every attempt is a full, independent call: it acquires its own pooled
//! connection, resolves the credential and configures it again.

use std::time::Duration;

use rand::Rng;

use crate::config::TransportConfig;
use crate::error::TransportError;
use crate::executor::{OutboundRequest, RequestExecutor};

/// Exponential backoff between attempts.
///
/// Delay is `min(initial * multiplier^n, max)` for the n-th retry, plus 0-25%
/// jitter when enabled (still capped at `max`).
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Initial backoff duration (default: 100ms)
    pub initial: Duration,

    /// Maximum backoff duration (default: 10s)
    pub max: Duration,

    /// Backoff multiplier for exponential growth (default: 2.0)
    pub multiplier: f64,

    /// Add random 0-25% to each delay (default: true)
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    /// Fast backoff for tests (1ms initial, 100ms max, no jitter)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(100),
            multiplier: 2.0,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (0-based).
    ///
    /// Non-finite or negative inputs fall back to sane values instead of
    /// panicking in `Duration::from_secs_f64`.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        // 1 day; beyond this a retry delay makes no sense
        const CEILING_SECS: f64 = 86_400.0;

        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 0.0 {
            self.multiplier
        } else {
            1.0
        };
        let max_secs = self.max.as_secs_f64().min(CEILING_SECS);
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);

        let raw = self.initial.as_secs_f64() * multiplier.powi(exponent);
        let base = if raw.is_finite() {
            raw.clamp(0.0, max_secs)
        } else {
            max_secs
        };
        let delay = Duration::from_secs_f64(base);

        let delay = if self.jitter {
            let factor = rand::rng().random_range(0.0..=0.25);
            delay + delay.mul_f64(factor)
        } else {
            delay
        };
        delay.min(Duration::from_secs_f64(max_secs))
    }
}

/// How many times a call may be attempted and how long to wait in between.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included (`0` behaves as `1`)
    pub max_attempts: u32,
    pub backoff: ExponentialBackoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&TransportConfig::default())
    }
}

impl RetryPolicy {
    /// Attempt budget from `http.Retry`, default backoff.
    #[must_use]
    pub fn from_config(config: &TransportConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            backoff: ExponentialBackoff::default(),
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Run `request` through `executor`, retrying retryable failures.
///
/// Only errors for which [`TransportError::is_retryable`] holds are retried;
/// anything else, and the last error once the budget is spent, is returned
/// unchanged.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn execute_with_retry(
    executor: &RequestExecutor,
    policy: &RetryPolicy,
    request: &OutboundRequest,
) -> Result<String, TransportError> {
    let attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        match executor.execute(request.clone()).await {
            Ok(body) => return Ok(body),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = policy.backoff.delay(attempt - 1);
                tracing::debug!(
                    service = executor.service_name(),
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis(),
                    error = %e,
                    "retrying payment call"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() && attempts > 1 {
                    tracing::warn!(
                        service = executor.service_name(),
                        attempts,
                        "retry budget exhausted"
                    );
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_delay_no_jitter() {
        let backoff = ExponentialBackoff {
            jitter: false,
            ..ExponentialBackoff::default()
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(20), Duration::from_secs(10));
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_delay_with_jitter_stays_in_range() {
        let backoff = ExponentialBackoff::default();
        for _ in 0..50 {
            let d = backoff.delay(0);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(125));
        }
        assert!(backoff.delay(30) <= Duration::from_secs(10));
    }

    #[test]
    fn test_delay_sanitizes_multiplier() {
        for multiplier in [f64::NAN, f64::INFINITY, -2.0] {
            let backoff = ExponentialBackoff {
                multiplier,
                jitter: false,
                ..ExponentialBackoff::default()
            };
            let d = backoff.delay(3);
            assert!(d <= Duration::from_secs(10), "{multiplier}: {d:?}");
        }
    }

    #[test]
    fn test_policy_from_config() {
        let config = TransportConfig {
            max_retries: 3,
            ..TransportConfig::for_testing()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.attempts(), 3);

        let zero = RetryPolicy {
            max_attempts: 0,
            ..policy
        };
        assert_eq!(zero.attempts(), 1);
    }
}
