//! # Engine Configuration
//!
//! Settings for worker sizing, retry policy, per-resource rate limits and circuit
//! breakers, and the connection pool. The engine never reads files or the
//! environment; callers build an [`EngineConfig`] directly or through
//! [`ConfigLoader`], which layers a config file and `LOOKUP_ENGINE__*` environment
//! overrides over the defaults.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lookup_engine::config::ConfigLoader;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new()
//!     .with_file("config/lookup_engine.toml")
//!     .with_env_overrides()
//!     .load()?;
//!
//! let max_attempts = config.retry.max_attempts;
//! let pool_size = config.pool.max_size;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigLoader;

use crate::database::PoolConfig;
use crate::orchestration::retry::RetryPolicy;
use crate::resilience::{AdaptiveRateConfig, CircuitBreakerConfig, RateLimiterConfig};

/// Top-level engine configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: WorkerPoolConfig,
    pub retry: RetryConfig,
    pub rate_limits: RateLimitSettings,
    pub circuit_breakers: CircuitBreakerSettings,
    pub pool: ConnectionPoolConfig,
    /// Advisory deadline passed to handlers; the handler aborts its own I/O
    pub job_timeout_ms: Option<u64>,
}

impl EngineConfig {
    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_ms.map(Duration::from_millis)
    }

    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.workers.validate()?;
        self.retry.validate()?;
        self.rate_limits.validate()?;
        self.circuit_breakers.validate()?;
        self.pool.validate()?;
        if self.job_timeout_ms == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "job_timeout_ms",
                0,
                "job timeout must be greater than 0 when set",
            ));
        }
        Ok(())
    }
}

/// Worker pool sizing and loop timing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Fixed worker count; auto-sized from system resources when absent
    pub worker_count: Option<usize>,
    /// Upper bound for auto-sizing and for per-batch concurrency requests
    pub max_workers: usize,
    /// Workers per available CPU when auto-sizing (handlers are I/O bound)
    pub workers_per_core: usize,
    /// Memory headroom reserved per worker when auto-sizing
    pub per_worker_memory_mb: u64,
    /// How long an idle worker waits on the queue before re-checking shutdown
    pub dequeue_poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: None,
            max_workers: 64,
            workers_per_core: 4,
            per_worker_memory_mb: 64,
            dequeue_poll_interval_ms: 250,
            shutdown_timeout_ms: 30_000,
        }
    }
}

impl WorkerPoolConfig {
    pub fn dequeue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.dequeue_poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.max_workers == 0 {
            return Err(ConfigurationError::invalid_value(
                "workers.max_workers",
                0,
                "must allow at least one worker",
            ));
        }
        if let Some(count) = self.worker_count {
            if count == 0 || count > self.max_workers {
                return Err(ConfigurationError::invalid_value(
                    "workers.worker_count",
                    count,
                    format!("must be between 1 and max_workers ({})", self.max_workers),
                ));
            }
        }
        if self.workers_per_core == 0 {
            return Err(ConfigurationError::invalid_value(
                "workers.workers_per_core",
                0,
                "must be greater than 0",
            ));
        }
        if self.dequeue_poll_interval_ms == 0 {
            return Err(ConfigurationError::invalid_value(
                "workers.dequeue_poll_interval_ms",
                0,
                "must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Retry and backoff settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per job, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Maximum multiplicative jitter, `0.0..1.0`
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            jitter_factor: self.jitter_factor,
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        self.to_retry_policy()
            .validate()
            .map_err(|reason| ConfigurationError::invalid_value("retry", self.max_attempts, reason))
    }
}

/// Token bucket settings for one resource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitResourceConfig {
    pub capacity: u32,
    pub refill_per_second: f64,
    /// Self-tune the refill rate from backpressure and success signals
    pub adaptive: bool,
    pub min_refill_per_second: f64,
    pub max_refill_per_second: f64,
    pub increase_step: f64,
    /// Consecutive successes required before each rate increase
    pub success_window: u32,
}

impl Default for RateLimitResourceConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_second: 5.0,
            adaptive: true,
            min_refill_per_second: 0.5,
            max_refill_per_second: 20.0,
            increase_step: 0.5,
            success_window: 10,
        }
    }
}

impl RateLimitResourceConfig {
    pub fn to_rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            capacity: self.capacity,
            refill_rate: self.refill_per_second,
            adaptive: self.adaptive.then(|| AdaptiveRateConfig {
                min_rate: self.min_refill_per_second,
                max_rate: self.max_refill_per_second,
                increase_step: self.increase_step,
                success_window: self.success_window,
            }),
        }
    }
}

/// Rate limits for all named resources
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// How long a worker waits for a token before the attempt fails
    pub acquire_timeout_ms: u64,
    pub default_config: RateLimitResourceConfig,
    /// Overrides keyed by resource name, e.g. `"scrape:treasurer"`
    pub resources: HashMap<String, RateLimitResourceConfig>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_ms: 10_000,
            default_config: RateLimitResourceConfig::default(),
            resources: HashMap::new(),
        }
    }
}

impl RateLimitSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Get configuration for a specific resource
    pub fn config_for_resource(&self, resource: &str) -> RateLimiterConfig {
        self.resources
            .get(resource)
            .unwrap_or(&self.default_config)
            .to_rate_limiter_config()
    }

    fn validate(&self) -> ConfigResult<()> {
        let sections = std::iter::once(("rate_limits.default_config".to_string(), &self.default_config))
            .chain(
                self.resources
                    .iter()
                    .map(|(name, config)| (format!("rate_limits.resources.{name}"), config)),
            );
        for (field, config) in sections {
            config
                .to_rate_limiter_config()
                .validate()
                .map_err(|reason| ConfigurationError::invalid_value(field, config.capacity, reason))?;
        }
        Ok(())
    }
}

/// Circuit breaker settings for one resource
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerComponentConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call is allowed
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerComponentConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerComponentConfig {
    /// Convert to resilience module's format
    pub fn to_resilience_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }
}

/// Circuit breakers for all named resources
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// When disabled, handlers are invoked without breaker protection
    pub enabled: bool,
    pub default_config: CircuitBreakerComponentConfig,
    pub resources: HashMap<String, CircuitBreakerComponentConfig>,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_config: CircuitBreakerComponentConfig::default(),
            resources: HashMap::new(),
        }
    }
}

impl CircuitBreakerSettings {
    /// Get configuration for a specific resource
    pub fn config_for_resource(&self, resource: &str) -> CircuitBreakerConfig {
        self.resources
            .get(resource)
            .unwrap_or(&self.default_config)
            .to_resilience_config()
    }

    fn validate(&self) -> ConfigResult<()> {
        let sections = std::iter::once(("circuit_breakers.default_config".to_string(), &self.default_config))
            .chain(
                self.resources
                    .iter()
                    .map(|(name, config)| (format!("circuit_breakers.resources.{name}"), config)),
            );
        for (field, config) in sections {
            config.to_resilience_config().validate().map_err(|reason| {
                ConfigurationError::invalid_value(field, config.failure_threshold, reason)
            })?;
        }
        Ok(())
    }
}

/// Connection pool bounds and timing
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionPoolConfig {
    /// Connections created eagerly by `warm_up`
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are discarded on the next acquisition
    pub idle_lifetime_ms: u64,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            min_size: 0,
            max_size: 10,
            acquire_timeout_ms: 5_000,
            idle_lifetime_ms: 300_000,
        }
    }
}

impl ConnectionPoolConfig {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_size: self.min_size,
            max_size: self.max_size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            idle_lifetime: Duration::from_millis(self.idle_lifetime_ms),
        }
    }

    fn validate(&self) -> ConfigResult<()> {
        self.to_pool_config()
            .validate()
            .map_err(|reason| ConfigurationError::invalid_value("pool", self.max_size, reason))
    }
}
