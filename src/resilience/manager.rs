//! # Resilience Registries
//!
//! Per-resource circuit breakers and token buckets, owned by one engine instance.
//! Entries are created lazily on first use from the per-resource settings, so
//! unrelated resources never throttle or trip each other.

use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::{CircuitBreakerSettings, RateLimitSettings};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerMetrics, RateLimiterSnapshot, TokenBucket,
};

/// Manager for the circuit breakers of every named resource
#[derive(Debug)]
pub struct CircuitBreakerManager {
    /// Collection of circuit breakers by resource name
    circuit_breakers: DashMap<String, Arc<CircuitBreaker>>,

    settings: CircuitBreakerSettings,
}

impl CircuitBreakerManager {
    pub fn new(settings: CircuitBreakerSettings) -> Self {
        Self {
            circuit_breakers: DashMap::new(),
            settings,
        }
    }

    /// Whether handler calls should be wrapped at all
    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    /// Get or create circuit breaker for a resource
    pub fn get_circuit_breaker(&self, resource: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.circuit_breakers.get(resource) {
            return Arc::clone(breaker.value());
        }

        let breaker = self
            .circuit_breakers
            .entry(resource.to_string())
            .or_insert_with(|| {
                info!(resource, "Created new circuit breaker");
                Arc::new(CircuitBreaker::new(
                    resource,
                    self.settings.config_for_resource(resource),
                ))
            });
        Arc::clone(breaker.value())
    }

    /// Get all circuit breaker names
    pub fn list_components(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .circuit_breakers
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Get metrics for a specific circuit breaker
    pub fn get_component_metrics(&self, resource: &str) -> Option<CircuitBreakerMetrics> {
        self.circuit_breakers
            .get(resource)
            .map(|breaker| breaker.metrics())
    }

    /// Metrics for every breaker, keyed by resource
    pub fn all_metrics(&self) -> BTreeMap<String, CircuitBreakerMetrics> {
        self.circuit_breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().metrics()))
            .collect()
    }

    /// Force every breaker closed
    pub fn reset_all(&self) {
        for entry in self.circuit_breakers.iter() {
            entry.value().force_closed();
        }
    }
}

/// Registry of token buckets keyed by resource name
#[derive(Debug)]
pub struct RateLimiterRegistry {
    buckets: DashMap<String, Arc<TokenBucket>>,
    settings: RateLimitSettings,
}

impl RateLimiterRegistry {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            buckets: DashMap::new(),
            settings,
        }
    }

    /// Get or create the bucket for a resource
    pub fn bucket(&self, resource: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.get(resource) {
            return Arc::clone(bucket.value());
        }

        let bucket = self
            .buckets
            .entry(resource.to_string())
            .or_insert_with(|| {
                Arc::new(TokenBucket::new(
                    resource,
                    self.settings.config_for_resource(resource),
                ))
            });
        Arc::clone(bucket.value())
    }

    /// Default wait used by workers acquiring tokens
    pub fn acquire_timeout(&self) -> std::time::Duration {
        self.settings.acquire_timeout()
    }

    pub fn snapshots(&self) -> BTreeMap<String, RateLimiterSnapshot> {
        self.buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}
