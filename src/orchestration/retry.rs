//! # Retry with Backoff
//!
//! One retry policy applied uniformly by every worker. Delays grow exponentially
//! from `base_delay`, are multiplied by a random jitter in `[1, 1 + jitter_factor)`
//! and are capped at `max_delay`.
//!
//! A validated policy has `multiplier >= 1 + jitter_factor`, so the smallest delay for
//! attempt `n + 1` is never below the largest delay for attempt `n`: successive delays
//! are non-decreasing whatever the jitter draws.

use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

/// Exponential backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Maximum multiplicative jitter, `0.0..1.0`
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !(0.0..1.0).contains(&self.jitter_factor) {
            return Err(format!(
                "jitter_factor must be in [0, 1), got {}",
                self.jitter_factor
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 + self.jitter_factor {
            return Err(format!(
                "multiplier ({}) must be at least 1 + jitter_factor ({})",
                self.multiplier,
                1.0 + self.jitter_factor
            ));
        }
        if self.base_delay > self.max_delay {
            return Err(format!(
                "base_delay ({:?}) must not exceed max_delay ({:?})",
                self.base_delay, self.max_delay
            ));
        }
        Ok(())
    }

    /// Whether another attempt is allowed after `attempt` failed with `error`
    pub fn should_retry(&self, attempt: u32, error: &EngineError) -> bool {
        error.is_retryable() && attempt < self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based), without jitter
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        self.scaled_delay(attempt, 1.0)
    }

    /// Delay before the attempt following `attempt` (1-based), with jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let jitter = if self.jitter_factor > 0.0 {
            fastrand::f64() * self.jitter_factor
        } else {
            0.0
        };
        self.scaled_delay(attempt, 1.0 + jitter)
    }

    fn scaled_delay(&self, attempt: u32, jitter: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent) * jitter;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Tracks the attempt count for one retried operation and hands out its delays
#[derive(Debug, Clone)]
pub struct BackoffCalculator {
    policy: RetryPolicy,
    attempt: u32,
    delays: Vec<Duration>,
}

impl BackoffCalculator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            delays: Vec::new(),
        }
    }

    /// Record the start of another attempt, returning its 1-based number
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempt += 1;
        self.attempt
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Next delay if `error` may be retried, `None` once the budget is spent or the
    /// error is permanent
    pub fn next_delay(&mut self, error: &EngineError) -> Option<Duration> {
        if !self.policy.should_retry(self.attempt, error) {
            return None;
        }
        let delay = self.policy.delay_for_attempt(self.attempt);
        self.delays.push(delay);
        Some(delay)
    }

    /// Every delay handed out so far, in order
    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    pub fn into_delays(self) -> Vec<Duration> {
        self.delays
    }
}

/// How a retried operation ended
#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome<T> {
    Succeeded(T),
    /// The last error, once it was permanent or the attempt budget ran out
    Failed(EngineError),
    /// The interrupt fired before the next attempt; carries its reason
    Interrupted(String),
}

/// Outcome plus the attempt history of one retried operation
#[derive(Debug, Clone, PartialEq)]
pub struct RetryReport<T> {
    pub outcome: RetryOutcome<T>,
    pub attempts: u32,
    /// Backoff delays handed out, in order. The last one may have been cut short by
    /// the interrupt.
    pub delays: Vec<Duration>,
}

/// Run `operation` until it succeeds, fails permanently or exhausts the policy,
/// stopping early when `interrupt` resolves.
///
/// The operation receives the 1-based attempt number. `interrupt` is called once
/// per backoff and raced against the sleep; it is polled first, so an interrupt that
/// is already pending stops the loop without sleeping. A running attempt is never
/// interrupted.
pub async fn retry_until_interrupted<T, F, Fut, I, IFut>(
    policy: &RetryPolicy,
    mut operation: F,
    mut interrupt: I,
) -> RetryReport<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    I: FnMut() -> IFut,
    IFut: Future<Output = String>,
{
    let mut backoff = BackoffCalculator::new(policy.clone());
    let outcome = loop {
        let attempt = backoff.begin_attempt();
        let error = match operation(attempt).await {
            Ok(value) => break RetryOutcome::Succeeded(value),
            Err(error) => error,
        };

        let Some(delay) = backoff.next_delay(&error) else {
            warn!(attempt, error = %error, "Giving up after final attempt");
            break RetryOutcome::Failed(error);
        };
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after backoff"
        );

        let interrupted = tokio::select! {
            biased;
            reason = interrupt() => Some(reason),
            () = tokio::time::sleep(delay) => None,
        };
        if let Some(reason) = interrupted {
            debug!(attempt, reason = %reason, "Retry loop interrupted");
            break RetryOutcome::Interrupted(reason);
        }
    };

    RetryReport {
        outcome,
        attempts: backoff.attempt(),
        delays: backoff.into_delays(),
    }
}

/// [`retry_until_interrupted`] without an interrupt
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let report =
        retry_until_interrupted(policy, operation, std::future::pending::<String>).await;
    match report.outcome {
        RetryOutcome::Succeeded(value) => Ok(value),
        RetryOutcome::Failed(error) => Err(error),
        RetryOutcome::Interrupted(_) => Err(EngineError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = policy();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            jitter_factor: 0.5,
            max_delay: Duration::from_secs(60),
            ..policy()
        };
        for _ in 0..100 {
            let delay = policy.delay_for_attempt(2);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy {
            max_attempts: 0,
            ..policy()
        }
        .validate()
        .is_err());
        assert!(RetryPolicy {
            jitter_factor: 1.0,
            ..policy()
        }
        .validate()
        .is_err());
        assert!(RetryPolicy {
            multiplier: 1.05,
            jitter_factor: 0.1,
            ..policy()
        }
        .validate()
        .is_err());
        assert!(RetryPolicy {
            base_delay: Duration::from_secs(5),
            ..policy()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_permanent_errors_are_not_retried() {
        let mut backoff = BackoffCalculator::new(policy());
        backoff.begin_attempt();
        let permanent = EngineError::HandlerFailure {
            message: "not found".to_string(),
            permanent: true,
        };
        assert!(backoff.next_delay(&permanent).is_none());
        assert!(backoff.delays().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&policy(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(EngineError::PoolExhausted {
                    waited: Duration::ZERO,
                })
            }
        })
        .await;

        assert!(matches!(result, Err(EngineError::PoolExhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_cuts_backoff_short() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30),
            ..policy()
        };
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            stop_tx.send_replace(true);
        });

        let start = tokio::time::Instant::now();
        let report: RetryReport<()> = retry_until_interrupted(
            &policy,
            |_| async { Err(EngineError::ConnectionFailed("refused".to_string())) },
            || {
                let mut stop = stop_rx.clone();
                async move {
                    let _ = stop.wait_for(|stop| *stop).await;
                    "stopped".to_string()
                }
            },
        )
        .await;

        assert_eq!(report.outcome, RetryOutcome::Interrupted("stopped".to_string()));
        assert_eq!(report.attempts, 1);
        assert_eq!(report.delays, vec![Duration::from_secs(30)]);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_interrupt_stops_before_sleeping() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();
        let report: RetryReport<()> = retry_until_interrupted(
            &policy(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(EngineError::ConnectionFailed("refused".to_string())) }
            },
            || async { "already cancelled".to_string() },
        )
        .await;

        assert_eq!(
            report.outcome,
            RetryOutcome::Interrupted("already cancelled".to_string())
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_report_records_attempts_and_delays() {
        let report = retry_until_interrupted(
            &policy(),
            |attempt| async move {
                if attempt < 3 {
                    Err(EngineError::PoolExhausted {
                        waited: Duration::ZERO,
                    })
                } else {
                    Ok(attempt)
                }
            },
            std::future::pending::<String>,
        )
        .await;

        assert_eq!(report.outcome, RetryOutcome::Succeeded(3));
        assert_eq!(report.attempts, 3);
        assert_eq!(
            report.delays,
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_recovers() {
        let result = retry_with_backoff(&policy(), |attempt| async move {
            if attempt < 3 {
                Err(EngineError::ConnectionFailed("reset by peer".to_string()))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }
}
