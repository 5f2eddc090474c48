// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Token bucket guarding an ingestion path.
//!
//! The bucket starts full and refills lazily: each whole `interval` elapsed
//! since the last refill adds `tokens_per_interval` tokens, capped at
//! `max_tokens`. Partial intervals carry over to the next refill.

use crate::errors::RateLimitError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Bucket capacity (default: 10,000).
    pub max_tokens: u64,
    /// Tokens added per elapsed interval (default: 1,000).
    pub tokens_per_interval: u64,
    /// Refill period (default: 100ms).
    pub interval: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10_000,
            tokens_per_interval: 1_000,
            interval: Duration::from_millis(100),
        }
    }
}

/// Bucket arithmetic, driven by explicit instants.
#[derive(Debug, Clone)]
pub(crate) struct TokenBucket {
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    pub(crate) fn full(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            tokens: config.max_tokens,
            last_refill: now,
        }
    }

    pub(crate) fn refill(&mut self, config: &RateLimiterConfig, now: Instant) {
        if config.interval.is_zero() {
            self.tokens = config.max_tokens;
            self.last_refill = now;
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_refill);
        let intervals = elapsed.as_nanos() / config.interval.as_nanos();
        if intervals == 0 {
            return;
        }
        let added = intervals.saturating_mul(u128::from(config.tokens_per_interval));
        let refilled = u128::from(self.tokens).saturating_add(added);
        self.tokens = u64::try_from(refilled.min(u128::from(config.max_tokens)))
            .unwrap_or(config.max_tokens);
        // Keep the partial interval so refills never drift.
        let whole = u32::try_from(intervals)
            .ok()
            .and_then(|n| config.interval.checked_mul(n));
        self.last_refill = match whole {
            Some(advance) => self.last_refill + advance,
            None => now,
        };
    }

    pub(crate) fn take(&mut self, config: &RateLimiterConfig, n: u64, now: Instant) -> bool {
        self.refill(config, now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    pub(crate) fn tokens(&self) -> u64 {
        self.tokens
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    bucket: Mutex<TokenBucket>,
    throttled: AtomicU64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        let bucket = TokenBucket::full(&config, Instant::now());
        Self {
            config,
            bucket: Mutex::new(bucket),
            throttled: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> MutexGuard<'_, TokenBucket> {
        self.bucket.lock().expect("lock poisoned")
    }

    /// Takes `n` tokens if available. On refusal the throttled count grows
    /// by one and nothing is taken.
    pub fn try_consume(&self, n: u64) -> bool {
        let granted = self.lock().take(&self.config, n, Instant::now());
        if !granted {
            self.throttled.fetch_add(1, Ordering::Relaxed);
        }
        granted
    }

    /// Waits until `n` tokens can be taken.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitError::ExceedsCapacity`] when `n` is larger than the
    /// bucket, since such a request could never be served.
    pub async fn consume(&self, n: u64) -> Result<(), RateLimitError> {
        if n > self.config.max_tokens {
            return Err(RateLimitError::ExceedsCapacity {
                requested: n,
                max: self.config.max_tokens,
            });
        }
        loop {
            let deficit = {
                let mut bucket = self.lock();
                if bucket.take(&self.config, n, Instant::now()) {
                    return Ok(());
                }
                n - bucket.tokens()
            };
            tokio::time::sleep(self.wait_for(deficit)).await;
        }
    }

    // Enough whole intervals to cover the deficit, never less than one.
    fn wait_for(&self, deficit: u64) -> Duration {
        let per_interval = self.config.tokens_per_interval.max(1);
        let intervals = deficit.div_ceil(per_interval).max(1);
        self.config
            .interval
            .checked_mul(u32::try_from(intervals).unwrap_or(u32::MAX))
            .unwrap_or(Duration::MAX)
            .max(self.config.interval)
    }

    pub fn available_tokens(&self) -> u64 {
        let mut bucket = self.lock();
        bucket.refill(&self.config, Instant::now());
        bucket.tokens()
    }

    pub fn throttled_count(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(max: u64, per: u64, interval_ms: u64) -> RateLimiterConfig {
        RateLimiterConfig {
            max_tokens: max,
            tokens_per_interval: per,
            interval: Duration::from_millis(interval_ms),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_consume_until_empty() {
        let limiter = RateLimiter::new(config(5, 1, 1_000));
        assert!(limiter.try_consume(3));
        assert!(limiter.try_consume(2));
        assert!(!limiter.try_consume(1));
        assert_eq!(limiter.throttled_count(), 1);
        assert_eq!(limiter.available_tokens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_and_keeps_remainder() {
        let limiter = RateLimiter::new(config(5, 2, 100));
        assert!(limiter.try_consume(5));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(limiter.available_tokens(), 2);
        tokio::time::advance(Duration::from_millis(50)).await;
        assert_eq!(limiter.available_tokens(), 4);
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(limiter.available_tokens(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_waits_for_refill() {
        let limiter = RateLimiter::new(config(4, 2, 100));
        limiter.consume(4).await.unwrap();

        let start = Instant::now();
        limiter.consume(3).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
        assert_eq!(limiter.throttled_count(), 0);
    }

    #[tokio::test]
    async fn test_consume_more_than_capacity_fails() {
        let limiter = RateLimiter::new(config(4, 2, 100));
        assert_eq!(
            limiter.consume(5).await,
            Err(RateLimitError::ExceedsCapacity {
                requested: 5,
                max: 4
            })
        );
    }

    proptest! {
        // Tokens handed out never exceed the initial bucket plus what the
        // elapsed intervals refilled, and the bucket stays within bounds.
        #[test]
        fn test_conservation(
            max in 1u64..50,
            per in 1u64..10,
            steps in proptest::collection::vec((0u64..300, 1u64..20), 1..60),
        ) {
            let cfg = config(max, per, 100);
            let start = Instant::now();
            let mut bucket = TokenBucket::full(&cfg, start);
            let mut now = start;
            let mut granted = 0u64;

            for (advance_ms, n) in steps {
                now += Duration::from_millis(advance_ms);
                if bucket.take(&cfg, n, now) {
                    granted += n;
                }
                prop_assert!(bucket.tokens() <= max);
                let intervals = (now - start).as_millis() as u64 / 100;
                prop_assert!(granted <= max + intervals * per);
            }
        }
    }
}
