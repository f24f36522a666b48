//! # Token Bucket Rate Limiter
//!
//! Per-resource pacing for outbound requests. Tokens refill lazily from elapsed
//! time at the current refill rate, capped at capacity. In adaptive mode the refill
//! rate halves on backpressure (down to a floor) and steps up after a window of
//! consecutive successes (up to a ceiling).

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::resilience::{RateLimiterConfig, RateLimiterSnapshot};
use crate::utils::time::saturating_add;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    consecutive_successes: u32,
    acquired: u64,
    timeouts: u64,
    backpressure_events: u64,
}

impl BucketState {
    fn refill(&mut self, capacity: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(capacity);
        self.last_refill = now;
    }
}

/// Token bucket for one named resource
#[derive(Debug)]
pub struct TokenBucket {
    resource: String,
    config: RateLimiterConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(resource: impl Into<String>, config: RateLimiterConfig) -> Self {
        let resource = resource.into();
        debug!(
            resource = %resource,
            capacity = config.capacity,
            refill_rate = config.refill_rate,
            adaptive = config.adaptive.is_some(),
            "Token bucket created"
        );

        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(config.capacity),
                refill_rate: config.refill_rate,
                last_refill: Instant::now(),
                consecutive_successes: 0,
                acquired: 0,
                timeouts: 0,
                backpressure_events: 0,
            }),
            resource,
            config,
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    fn capacity(&self) -> f64 {
        f64::from(self.config.capacity)
    }

    /// Take a token if one is available right now
    pub fn try_acquire(&self) -> bool {
        self.try_take().is_ok()
    }

    /// Take one token or report how long until the next one accrues
    fn try_take(&self) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        state.refill(self.capacity(), Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            state.acquired += 1;
            Ok(())
        } else {
            let wait = (1.0 - state.tokens) / state.refill_rate;
            Err(Duration::from_secs_f64(wait).max(MIN_POLL_INTERVAL))
        }
    }

    /// Take one token, waiting up to `timeout` for the bucket to refill
    pub async fn acquire(&self, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        let deadline = saturating_add(start, timeout);

        loop {
            let wait = match self.try_take() {
                Ok(()) => return Ok(()),
                Err(wait) => wait,
            };

            let now = Instant::now();
            if saturating_add(now, wait) > deadline {
                self.state.lock().timeouts += 1;
                debug!(
                    resource = %self.resource,
                    timeout_ms = timeout.as_millis() as u64,
                    "Rate limit token not available in time"
                );
                return Err(EngineError::RateLimitTimeout {
                    resource: self.resource.clone(),
                    waited: now.saturating_duration_since(start),
                });
            }

            tokio::time::sleep(wait).await;
        }
    }

    /// The resource told us to slow down: halve the refill rate, floored at the minimum
    pub fn record_backpressure(&self) {
        let Some(adaptive) = &self.config.adaptive else {
            return;
        };
        let mut state = self.state.lock();
        state.refill(self.capacity(), Instant::now());
        let previous = state.refill_rate;
        state.refill_rate = (previous / 2.0).max(adaptive.min_rate);
        state.consecutive_successes = 0;
        state.backpressure_events += 1;

        warn!(
            resource = %self.resource,
            previous_rate = previous,
            refill_rate = state.refill_rate,
            "🐢 Backpressure received, reducing refill rate"
        );
    }

    /// Count a success; every full success window raises the refill rate by one step
    pub fn record_success(&self) {
        let Some(adaptive) = &self.config.adaptive else {
            return;
        };
        let mut state = self.state.lock();
        state.consecutive_successes += 1;
        if state.consecutive_successes < adaptive.success_window {
            return;
        }
        state.consecutive_successes = 0;
        if state.refill_rate >= adaptive.max_rate {
            return;
        }

        state.refill(self.capacity(), Instant::now());
        let previous = state.refill_rate;
        state.refill_rate = (previous + adaptive.increase_step).min(adaptive.max_rate);
        info!(
            resource = %self.resource,
            previous_rate = previous,
            refill_rate = state.refill_rate,
            "Refill rate increased after sustained success"
        );
    }

    /// Current refill rate in tokens per second
    pub fn refill_rate(&self) -> f64 {
        self.state.lock().refill_rate
    }

    /// Tokens currently available
    pub fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock();
        state.refill(self.capacity(), Instant::now());
        state.tokens
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let mut state = self.state.lock();
        state.refill(self.capacity(), Instant::now());
        RateLimiterSnapshot {
            resource: self.resource.clone(),
            capacity: self.config.capacity,
            tokens: state.tokens,
            refill_rate: state.refill_rate,
            acquired: state.acquired,
            timeouts: state.timeouts,
            backpressure_events: state.backpressure_events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::AdaptiveRateConfig;

    fn bucket(capacity: u32, rate: f64) -> TokenBucket {
        TokenBucket::new(
            "api",
            RateLimiterConfig {
                capacity,
                refill_rate: rate,
                adaptive: None,
            },
        )
    }

    fn adaptive_bucket() -> TokenBucket {
        TokenBucket::new(
            "scrape:treasurer",
            RateLimiterConfig {
                capacity: 5,
                refill_rate: 8.0,
                adaptive: Some(AdaptiveRateConfig {
                    min_rate: 1.0,
                    max_rate: 10.0,
                    increase_step: 1.0,
                    success_window: 3,
                }),
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_plus_one_with_zero_timeout_times_out() {
        let bucket = bucket(3, 1.0);
        let mut timeouts = 0;
        for _ in 0..4 {
            if let Err(EngineError::RateLimitTimeout { resource, .. }) =
                bucket.acquire(Duration::ZERO).await
            {
                assert_eq!(resource, "api");
                timeouts += 1;
            }
        }
        assert!(timeouts >= 1);
        assert_eq!(bucket.snapshot().acquired, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_waits_for_refill() {
        let bucket = bucket(1, 10.0);
        bucket.acquire(Duration::MAX).await.unwrap();
        bucket.acquire(Duration::MAX).await.unwrap();
        assert_eq!(bucket.snapshot().acquired, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let bucket = bucket(1, 10.0);
        bucket.acquire(Duration::ZERO).await.unwrap();

        let start = Instant::now();
        bucket.acquire(Duration::from_secs(1)).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(99), "waited {waited:?}");
        assert!(waited < Duration::from_millis(200), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_fails_when_refill_is_too_slow() {
        let bucket = bucket(1, 0.5);
        bucket.acquire(Duration::ZERO).await.unwrap();

        let result = bucket.acquire(Duration::from_millis(500)).await;
        assert!(matches!(result, Err(EngineError::RateLimitTimeout { .. })));
        assert_eq!(bucket.snapshot().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_capacity() {
        let bucket = bucket(4, 100.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.available_tokens() <= 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_halves_rate_with_floor() {
        let bucket = adaptive_bucket();
        bucket.record_backpressure();
        assert_eq!(bucket.refill_rate(), 4.0);
        bucket.record_backpressure();
        bucket.record_backpressure();
        assert_eq!(bucket.refill_rate(), 1.0);
        bucket.record_backpressure();
        assert_eq!(bucket.refill_rate(), 1.0);
        assert_eq!(bucket.snapshot().backpressure_events, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_window_raises_rate_with_ceiling() {
        let bucket = adaptive_bucket();
        bucket.record_success();
        bucket.record_success();
        assert_eq!(bucket.refill_rate(), 8.0);
        bucket.record_success();
        assert_eq!(bucket.refill_rate(), 9.0);

        for _ in 0..9 {
            bucket.record_success();
        }
        assert_eq!(bucket.refill_rate(), 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_resets_success_window() {
        let bucket = adaptive_bucket();
        bucket.record_success();
        bucket.record_success();
        bucket.record_backpressure();
        bucket.record_success();
        assert_eq!(bucket.refill_rate(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_adaptive_bucket_ignores_signals() {
        let bucket = bucket(2, 3.0);
        bucket.record_backpressure();
        for _ in 0..50 {
            bucket.record_success();
        }
        assert_eq!(bucket.refill_rate(), 3.0);
    }
}
