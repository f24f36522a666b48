//! # Resilience Metrics
//!
//! Point-in-time counters for circuit breakers and token buckets, surfaced through
//! engine statistics.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::resilience::CircuitState;

/// Metrics for a single circuit breaker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    /// Total number of calls that reached the wrapped operation
    pub total_calls: u64,

    /// Number of successful calls
    pub success_count: u64,

    /// Number of calls counted as failures
    pub failure_count: u64,

    /// Calls rejected without invoking the operation
    pub rejected_count: u64,

    /// Current consecutive failure count
    pub consecutive_failures: u32,

    /// How many times the circuit has opened
    pub times_opened: u64,

    /// Total duration of all operations
    pub total_duration: Duration,

    /// Current circuit breaker state
    pub current_state: CircuitState,

    /// Calculated failure rate (0.0 to 1.0)
    pub failure_rate: f64,

    /// Average operation duration
    pub average_duration: Duration,
}

impl CircuitBreakerMetrics {
    /// Create new metrics instance with zero values
    pub fn new() -> Self {
        Self {
            total_calls: 0,
            success_count: 0,
            failure_count: 0,
            rejected_count: 0,
            consecutive_failures: 0,
            times_opened: 0,
            total_duration: Duration::ZERO,
            current_state: CircuitState::Closed,
            failure_rate: 0.0,
            average_duration: Duration::ZERO,
        }
    }

    /// Fill in derived rates from the raw counters
    pub(crate) fn finalize(mut self) -> Self {
        if self.total_calls > 0 {
            self.failure_rate = self.failure_count as f64 / self.total_calls as f64;
            self.average_duration =
                Duration::from_secs_f64(self.total_duration.as_secs_f64() / self.total_calls as f64);
        }
        self
    }
}

impl Default for CircuitBreakerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of a token bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterSnapshot {
    pub resource: String,
    pub capacity: u32,
    pub tokens: f64,
    pub refill_rate: f64,
    pub acquired: u64,
    pub timeouts: u64,
    pub backpressure_events: u64,
}
