//! # Circuit Breaker Implementation
//!
//! Fault isolation for a single named resource. Three states:
//! Closed (normal operation), Open (failing fast), and Half-Open (one trial call).
//!
//! - Closed → Open after `failure_threshold` consecutive failures
//! - Open → Half-Open once `cooldown` has elapsed since the circuit opened
//! - Half-Open admits exactly one trial call; success closes, failure re-opens

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::resilience::{CircuitBreakerConfig, CircuitBreakerMetrics};

/// Circuit breaker states representing the current operational mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - all calls are allowed through
    Closed,
    /// Failure mode - all calls fail fast without executing
    Open,
    /// Testing recovery - a single trial call is allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Errors that can occur during circuit breaker operation
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, rejecting all calls
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    /// Operation failed and was recorded
    #[error("Operation failed: {0}")]
    OperationFailed(E),
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    metrics: CircuitBreakerMetrics,
}

/// Core circuit breaker; all state transitions happen under one lock
#[derive(Debug)]
pub struct CircuitBreaker {
    /// Component name for logging and metrics
    name: String,

    /// Configuration parameters
    config: CircuitBreakerConfig,

    inner: Mutex<BreakerState>,
}

/// Admission ticket for one call. A trial ticket dropped without an outcome
/// (the caller's future was cancelled) frees the half-open slot again.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.breaker.inner.lock();
            inner.trial_in_flight = false;
            debug!(component = %self.breaker.name, "Half-open trial abandoned");
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        info!(
            component = %name,
            failure_threshold = config.failure_threshold,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "🛡️ Circuit breaker initialized"
        );

        Self {
            name,
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                opened_at: None,
                trial_in_flight: false,
                metrics: CircuitBreakerMetrics::new(),
            }),
        }
    }

    /// Get current circuit state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get component name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation with circuit breaker protection; every error counts as a failure
    pub async fn call<F, T, E, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_filtered(operation, |_| true).await
    }

    /// Execute an operation, counting only errors for which `is_failure` returns true
    /// against the resource. Other errors prove the resource answered and are
    /// recorded as successes.
    pub async fn call_filtered<F, T, E, Fut, P>(
        &self,
        operation: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        let mut permit = self.admit().ok_or_else(|| CircuitBreakerError::CircuitOpen {
            component: self.name.clone(),
        })?;

        let start_time = Instant::now();
        let result = operation().await;
        let duration = start_time.elapsed();

        match &result {
            Err(e) if is_failure(e) => self.record_failure(duration),
            _ => self.record_success(duration),
        }
        permit.settled = true;

        result.map_err(CircuitBreakerError::OperationFailed)
    }

    /// Decide whether a call may proceed, moving Open → HalfOpen when the cooldown is over
    fn admit(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map_or(true, |opened| opened.elapsed() >= self.config.cooldown);
                if !cooled_down {
                    inner.metrics.rejected_count += 1;
                    return None;
                }
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                info!(component = %self.name, "🟡 Circuit breaker half-open (testing recovery)");
                true
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.metrics.rejected_count += 1;
                    return None;
                }
                inner.trial_in_flight = true;
                true
            }
        };

        Some(CallPermit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    /// Record a successful operation
    fn record_success(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.metrics.total_calls += 1;
        inner.metrics.success_count += 1;
        inner.metrics.total_duration += duration;
        inner.consecutive_failures = 0;

        debug!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            "🟢 Operation succeeded"
        );

        if inner.state == CircuitState::HalfOpen {
            inner.state = CircuitState::Closed;
            inner.trial_in_flight = false;
            inner.opened_at = None;
            info!(
                component = %self.name,
                total_calls = inner.metrics.total_calls,
                "🟢 Circuit breaker closed (recovered)"
            );
        }
    }

    /// Record a failed operation
    fn record_failure(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.metrics.total_calls += 1;
        inner.metrics.failure_count += 1;
        inner.metrics.total_duration += duration;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(now);

        warn!(
            component = %self.name,
            duration_ms = duration.as_millis() as u64,
            consecutive_failures = inner.consecutive_failures,
            "🔴 Operation failed"
        );

        let should_open = match inner.state {
            CircuitState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            // Any failure in half-open state immediately re-opens the circuit
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            Self::open(&self.name, &self.config, &mut inner, now);
        }
    }

    fn open(name: &str, config: &CircuitBreakerConfig, inner: &mut BreakerState, now: Instant) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.trial_in_flight = false;
        inner.metrics.times_opened += 1;

        error!(
            component = %name,
            consecutive_failures = inner.consecutive_failures,
            failure_threshold = config.failure_threshold,
            cooldown_ms = config.cooldown.as_millis() as u64,
            "🔴 Circuit breaker opened (failing fast)"
        );
    }

    /// Force circuit to open state (for emergency situations)
    pub fn force_open(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced open");
        let mut inner = self.inner.lock();
        Self::open(&self.name, &self.config, &mut inner, Instant::now());
    }

    /// Force circuit to closed state (for emergency recovery)
    pub fn force_closed(&self) {
        warn!(component = %self.name, "🚨 Circuit breaker forced closed");
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    /// Time of the most recent recorded failure
    pub fn last_failure(&self) -> Option<Instant> {
        self.inner.lock().last_failure
    }

    /// Get current metrics snapshot
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let inner = self.inner.lock();
        let mut snapshot = inner.metrics.clone();
        snapshot.current_state = inner.state;
        snapshot.consecutive_failures = inner.consecutive_failures;
        snapshot.finalize()
    }

    /// Check if circuit is healthy (closed state with low failure rate)
    pub fn is_healthy(&self) -> bool {
        let metrics = self.metrics();
        if metrics.current_state != CircuitState::Closed {
            return false;
        }

        if metrics.total_calls < 10 {
            // Too few calls to determine health
            return true;
        }

        metrics.failure_rate < 0.1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::sleep;

    fn config(threshold: u32, cooldown_ms: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(cooldown_ms),
        }
    }

    #[tokio::test]
    async fn test_circuit_breaker_normal_operation() {
        let circuit = CircuitBreaker::new("test", config(3, 100));

        // Should start in closed state
        assert_eq!(circuit.state(), CircuitState::Closed);

        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());

        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.success_count, 1);
        assert_eq!(metrics.failure_count, 0);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_on_failures_and_fails_fast() {
        let circuit = CircuitBreaker::new("test", config(2, 100));

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Closed);

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(circuit.last_failure().is_some());

        // Next call should fail fast without running the operation
        let invoked = AtomicU32::new(0);
        let result = circuit
            .call(|| async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>("should not execute")
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(circuit.metrics().rejected_count, 1);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let circuit = CircuitBreaker::new("test", config(2, 100));

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        let _ = circuit.call(|| async { Ok::<_, &str>("ok".to_string()) }).await;
        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;

        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(circuit.metrics().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_recovery() {
        let circuit = CircuitBreaker::new("test", config(1, 50));

        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;

        // Next call should transition to half-open and succeed
        let result = circuit.call(|| async { Ok::<_, String>("success") }).await;
        assert!(result.is_ok());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let circuit = CircuitBreaker::new("test", config(3, 50));
        for _ in 0..3 {
            let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        }
        assert_eq!(circuit.state(), CircuitState::Open);

        sleep(Duration::from_millis(60)).await;
        let _ = circuit.call(|| async { Err::<String, _>("still down") }).await;
        assert_eq!(circuit.state(), CircuitState::Open);
        assert_eq!(circuit.metrics().times_opened, 2);

        // Cooldown restarts from the trial failure
        let result = circuit.call(|| async { Ok::<_, String>("nope") }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_exactly_one_trial() {
        let circuit = Arc::new(CircuitBreaker::new("test", config(1, 50)));
        let _ = circuit.call(|| async { Err::<String, _>("error") }).await;
        sleep(Duration::from_millis(60)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_circuit = Arc::clone(&circuit);
        let trial = tokio::spawn(async move {
            trial_circuit
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<_, String>("recovered")
                })
                .await
                .is_ok()
        });

        // Let the trial task take the half-open slot
        tokio::task::yield_now().await;
        while circuit.state() != CircuitState::HalfOpen {
            tokio::task::yield_now().await;
        }

        let second = circuit.call(|| async { Ok::<_, String>("second") }).await;
        assert!(matches!(second, Err(CircuitBreakerError::CircuitOpen { .. })));

        release_tx.send(()).unwrap();
        assert!(trial.await.unwrap());
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_filtered_errors_do_not_trip() {
        let circuit = CircuitBreaker::new("test", config(1, 1_000));

        let result = circuit
            .call_filtered(|| async { Err::<(), _>("not found") }, |_| false)
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::OperationFailed("not found"))));
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_force_operations() {
        let circuit = CircuitBreaker::new("test", config(1, 1_000));

        circuit.force_open();
        assert_eq!(circuit.state(), CircuitState::Open);
        assert!(!circuit.is_healthy());

        circuit.force_closed();
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert!(circuit.is_healthy());
    }
}
