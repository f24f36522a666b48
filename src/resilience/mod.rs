//! # Resilience Module
//!
//! Fault tolerance primitives applied per named resource (e.g. `"api"`,
//! `"scrape:treasurer"`).
//!
//! ## Architecture
//!
//! - **Circuit Breakers**: Stop calling a resource that keeps failing until it cools down
//! - **Token Buckets**: Pace outbound requests, self-tuning from backpressure signals
//! - **Registries**: Engine-owned maps creating both lazily from per-resource settings
//!
//! ## Usage
//!
//! ```rust,no_run
//! use lookup_engine::resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     cooldown: Duration::from_secs(30),
//! };
//!
//! let circuit_breaker = CircuitBreaker::new("scrape:treasurer", config);
//!
//! let page = circuit_breaker
//!     .call(|| async { Ok::<&str, std::io::Error>("<html>…</html>") })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod config;
pub mod manager;
pub mod metrics;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerError, CircuitState};
pub use config::{AdaptiveRateConfig, CircuitBreakerConfig, RateLimiterConfig};
pub use manager::{CircuitBreakerManager, RateLimiterRegistry};
pub use metrics::{CircuitBreakerMetrics, RateLimiterSnapshot};
pub use rate_limiter::TokenBucket;
