//! # Resilience Configuration
//!
//! Runtime settings for individual circuit breakers and token buckets. The
//! serde-facing settings in [`crate::config`] convert into these.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a single circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening circuit
    pub failure_threshold: u32,

    /// Time to wait in open state before allowing a trial call
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create configuration for database operations
    pub fn for_database() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }

    /// Create configuration for page scrapes, which fail noisily
    pub fn for_scrape() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("failure_threshold must be greater than 0".to_string());
        }

        if self.failure_threshold > 100 {
            return Err("failure_threshold should not exceed 100".to_string());
        }

        if self.cooldown.is_zero() {
            return Err("cooldown must be greater than 0".to_string());
        }

        if self.cooldown > Duration::from_secs(3600) {
            return Err("cooldown should not exceed one hour".to_string());
        }

        Ok(())
    }
}

/// Self-tuning bounds for a token bucket's refill rate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveRateConfig {
    /// Floor for the refill rate after repeated backpressure
    pub min_rate: f64,
    /// Ceiling for the refill rate after sustained success
    pub max_rate: f64,
    /// Tokens/second added after each success window
    pub increase_step: f64,
    /// Consecutive successes required per increase
    pub success_window: u32,
}

/// Configuration for a single token bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Bucket size
    pub capacity: u32,
    /// Initial refill rate in tokens per second
    pub refill_rate: f64,
    /// Adaptive mode, disabled when `None`
    pub adaptive: Option<AdaptiveRateConfig>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_rate: 5.0,
            adaptive: None,
        }
    }
}

impl RateLimiterConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("capacity must be greater than 0".to_string());
        }

        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err("refill_rate must be a positive number".to_string());
        }

        if let Some(adaptive) = &self.adaptive {
            if !(adaptive.min_rate.is_finite() && adaptive.min_rate > 0.0) {
                return Err("adaptive min_rate must be a positive number".to_string());
            }
            if adaptive.max_rate < adaptive.min_rate {
                return Err("adaptive max_rate must not be below min_rate".to_string());
            }
            if self.refill_rate < adaptive.min_rate || self.refill_rate > adaptive.max_rate {
                return Err("refill_rate must lie within the adaptive bounds".to_string());
            }
            if !(adaptive.increase_step.is_finite() && adaptive.increase_step > 0.0) {
                return Err("adaptive increase_step must be a positive number".to_string());
            }
            if adaptive.success_window == 0 {
                return Err("adaptive success_window must be greater than 0".to_string());
            }
        }

        Ok(())
    }
}
