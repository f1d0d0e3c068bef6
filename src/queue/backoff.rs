//! Retry delay strategies for failed applies

use rand::Rng;
use std::time::Duration;

use crate::config::BackoffConfig;

/// Computes how long a failed queue row waits before its next attempt
pub trait BackoffStrategy: Send + Sync + 'static {
    /// Delay after the `failure_count`-th consecutive failure (1-based)
    fn next_retry_delay(&self, failure_count: u32) -> Duration;
}

/// Geometric backoff with an upper bound and random jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    /// Create a strategy; `jitter` is clamped to `[0, 1]`
    pub fn new(base: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    fn undithered(&self, failure_count: u32) -> f64 {
        let exponent = failure_count.saturating_sub(1).min(63) as i32;
        let delay = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        delay.min(self.max.as_secs_f64())
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_retry_delay(&self, failure_count: u32) -> Duration {
        let delay = self.undithered(failure_count);
        let spread = delay * self.jitter;
        let jittered = if spread > 0.0 {
            delay + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            delay
        };
        Duration::from_secs_f64(jittered.clamp(0.0, self.max.as_secs_f64()))
    }
}

/// Same delay after every failure
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    /// Create a fixed delay strategy
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl BackoffStrategy for FixedBackoff {
    fn next_retry_delay(&self, _failure_count: u32) -> Duration {
        self.delay
    }
}

/// Build the strategy described by configuration
pub fn from_config(config: &BackoffConfig) -> Box<dyn BackoffStrategy> {
    match config {
        BackoffConfig::Exponential {
            base_ms,
            max_ms,
            multiplier,
            jitter,
        } => Box::new(ExponentialBackoff::new(
            Duration::from_millis(*base_ms),
            Duration::from_millis(*max_ms),
            *multiplier,
            *jitter,
        )),
        BackoffConfig::Fixed { delay_ms } => {
            Box::new(FixedBackoff::new(Duration::from_millis(*delay_ms)))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            2.0,
            0.0,
        );
        assert_eq!(backoff.next_retry_delay(1), Duration::from_millis(100));
        assert_eq!(backoff.next_retry_delay(2), Duration::from_millis(200));
        assert_eq!(backoff.next_retry_delay(4), Duration::from_millis(800));
        assert_eq!(backoff.next_retry_delay(5), Duration::from_secs(1));
        assert_eq!(backoff.next_retry_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(1_000),
            Duration::from_secs(60),
            2.0,
            0.5,
        );
        for _ in 0..100 {
            let delay = backoff.next_retry_delay(1);
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(1_500));
        }
    }

    #[test]
    fn test_from_config() {
        let fixed = from_config(&BackoffConfig::Fixed { delay_ms: 250 });
        assert_eq!(fixed.next_retry_delay(7), Duration::from_millis(250));
        let default = from_config(&BackoffConfig::default());
        assert!(default.next_retry_delay(1) > Duration::ZERO);
    }
}
