//! Retry classification and exponential backoff.
//!
//! [`RetryPolicy`] is pure: it decides whether an error is worth another attempt and how
//! long to wait before it. The fetcher owns the loop and the sleeping.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::error::{ErrorKind, FetchError};

/// Whether another attempt can change the outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retryability {
    Retryable,
    Terminal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter,
        }
    }

    /// Exactly one attempt, never retried.
    pub fn no_retry() -> Self {
        Self::new(&RetryConfig {
            max_attempts: 1,
            ..RetryConfig::default()
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Timeouts, connection failures, rate limiting and upstream unavailability are
    /// retryable. Bad requests, auth failures, missing resources and unusable responses
    /// are not.
    pub fn classify(&self, error: &FetchError) -> Retryability {
        match error.kind() {
            ErrorKind::TransientIo => Retryability::Retryable,
            _ => Retryability::Terminal,
        }
    }

    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay to wait after failed attempt `attempt` (1-based): `base · multiplier^(attempt-1)`,
    /// capped at the configured maximum.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let computed = (base_ms * self.multiplier.powi(exponent)).min(max_ms);
        let capped = if computed.is_finite() { computed } else { max_ms };
        let with_jitter = if self.jitter {
            capped + capped * 0.25 * jitter_fraction()
        } else {
            capped
        };
        Duration::from_millis(with_jitter as u64)
    }

    /// Delay honouring a server-provided retry-after hint when it is longer. The hint is
    /// capped at the configured maximum delay.
    pub fn delay_for(&self, attempt: u32, error: &FetchError) -> Duration {
        let computed = self.delay(attempt);
        match error {
            FetchError::RateLimited { retry_after_secs } => {
                let hint = Duration::from_secs(*retry_after_secs).min(self.max_delay);
                computed.max(hint)
            }
            _ => computed,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

// Sub-second clock noise is enough to spread retries; no need for a PRNG.
fn jitter_fraction() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let policy = RetryPolicy::default();
        for retryable in [
            FetchError::Timeout { timeout_secs: 30 },
            FetchError::Connection {
                message: "reset".into(),
            },
            FetchError::RateLimited {
                retry_after_secs: 1,
            },
            FetchError::ServerUnavailable {
                status: 503,
                message: String::new(),
            },
        ] {
            assert_eq!(policy.classify(&retryable), Retryability::Retryable);
        }
        for terminal in [
            FetchError::BadRequest {
                status: 400,
                message: String::new(),
            },
            FetchError::AuthFailed { status: 401 },
            FetchError::NotFound {
                message: String::new(),
            },
            FetchError::InvalidResponse {
                message: String::new(),
            },
        ] {
            assert_eq!(policy.classify(&terminal), Retryability::Terminal);
        }
    }

    #[test]
    fn test_default_delays_match_two_four_eight() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(2));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(3), Duration::from_secs(8));
        assert_eq!(policy.delay(4), Duration::from_secs(10));
        assert_eq!(policy.delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_attempt_ceiling() {
        let policy = RetryPolicy::default();
        assert!(policy.has_attempts_left(1));
        assert!(policy.has_attempts_left(2));
        assert!(!policy.has_attempts_left(3));
        assert!(!RetryPolicy::no_retry().has_attempts_left(1));
    }

    #[test]
    fn test_zero_attempts_is_clamped_to_one() {
        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        });
        assert_eq!(policy.max_attempts(), 1);
    }

    #[test]
    fn test_rate_limit_hint_extends_delay() {
        let policy = RetryPolicy::default();
        let err = FetchError::RateLimited {
            retry_after_secs: 7,
        };
        assert_eq!(policy.delay_for(1, &err), Duration::from_secs(7));
        let short = FetchError::RateLimited {
            retry_after_secs: 0,
        };
        assert_eq!(policy.delay_for(2, &short), Duration::from_secs(4));
    }

    #[test]
    fn test_rate_limit_hint_is_capped_at_max_delay() {
        let policy = RetryPolicy::default();
        let day = FetchError::RateLimited {
            retry_after_secs: 86_400,
        };
        assert_eq!(policy.delay_for(1, &day), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3, &day), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy::new(&RetryConfig {
            jitter: true,
            ..RetryConfig::default()
        });
        for attempt in 1..=5 {
            let plain = RetryPolicy::default().delay(attempt);
            let jittered = policy.delay(attempt);
            assert!(jittered >= plain);
            assert!(jittered.as_millis() <= plain.as_millis() * 5 / 4 + 1);
        }
    }
}
