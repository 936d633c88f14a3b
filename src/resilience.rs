//! Backoff between bulk write attempts and a document rate limit for the
//! search index.
//!
//! ```rust,no_run
//! # async fn example() {
//! use graph_index_replicator::resilience::{RateLimiter, RateLimitConfig, RetryConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig { burst_size: 100, refill_rate: 1000 });
//! limiter.acquire_documents(250).await; // one permit per document
//!
//! let backoff = RetryConfig::default();
//! assert_eq!(backoff.delay_for_attempt(2).as_millis(), 200);
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Retry policy of the bulk writer.
///
/// Attempt 1 is the initial request; attempts 2..=`max_attempts` resend
/// whatever failed retryably.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: usize,
    /// Wait before the first retry.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Upper bound for one bulk request. Longer requests count as transport
    /// failures.
    pub request_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Millisecond delays for unit tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            request_timeout: Duration::from_millis(500),
        }
    }

    /// Wait before retry number `retry` (1 is the first retry):
    /// `initial_delay * backoff_factor^(retry - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, retry: usize) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);

        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Index write quota: `refill_rate` documents per second, with bursts of up
/// to `burst_size` documents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

/// Token bucket shared by every dispatch lane. One document costs one
/// permit; zero settings are raised to one.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    burst: NonZeroU32,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let rate = NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN);

        Self {
            limiter: GovLimiter::direct(Quota::per_second(rate).allow_burst(burst)),
            burst,
        }
    }

    /// Wait until `docs` documents may be sent. Requests larger than the
    /// burst are paid for in burst-sized installments.
    pub async fn acquire_documents(&self, docs: usize) {
        let mut remaining = docs;
        while remaining > 0 {
            let chunk = remaining.min(self.burst.get() as usize);
            let permits = NonZeroU32::new(chunk as u32).unwrap_or(NonZeroU32::MIN);
            if self.limiter.until_n_ready(permits).await.is_err() {
                // Chunk never exceeds the burst; pay one permit if it somehow does
                self.limiter.until_ready().await;
                remaining -= 1;
                continue;
            }
            remaining -= chunk;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            request_timeout: Duration::from_secs(5),
        };

        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(16));
        assert_eq!(config.delay_for_attempt(6), Duration::from_secs(30));
        assert_eq!(config.delay_for_attempt(10_000), Duration::from_secs(30));
    }

    #[test]
    fn test_zeroth_retry_waits_initial_delay() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), config.initial_delay);
    }

    #[test]
    fn test_flat_backoff() {
        let config = RetryConfig { backoff_factor: 1.0, ..RetryConfig::testing() };
        assert_eq!(config.delay_for_attempt(1), config.delay_for_attempt(7));
    }

    #[tokio::test]
    async fn test_burst_is_free() {
        let limiter = RateLimiter::new(RateLimitConfig { burst_size: 50, refill_rate: 1 });

        let started = std::time::Instant::now();
        limiter.acquire_documents(50).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_exhausted_quota_blocks() {
        let limiter = RateLimiter::new(RateLimitConfig { burst_size: 5, refill_rate: 1 });
        limiter.acquire_documents(5).await;

        let blocked = tokio::time::timeout(Duration::from_millis(100), limiter.acquire_documents(1)).await;
        assert!(blocked.is_err(), "sixth document waits for a refill");
    }

    #[tokio::test]
    async fn test_request_larger_than_burst_completes() {
        let limiter = RateLimiter::new(RateLimitConfig { burst_size: 10, refill_rate: 10_000 });

        tokio::time::timeout(Duration::from_secs(1), limiter.acquire_documents(200))
            .await
            .expect("paid in installments");
        limiter.acquire_documents(0).await;
    }

    #[tokio::test]
    async fn test_zero_settings_are_raised() {
        let limiter = RateLimiter::new(RateLimitConfig { burst_size: 0, refill_rate: 0 });
        tokio::time::timeout(Duration::from_millis(100), limiter.acquire_documents(1))
            .await
            .expect("one permit available");
    }
}
