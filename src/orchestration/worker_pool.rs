//! # Worker Pool
//!
//! Fixed set of worker tasks pulling from the shared [`JobQueue`]. The size is decided
//! once when the pool starts and never changes while it runs.
//!
//! Each job runs through one pipeline, retried as a whole by
//! [`retry_until_interrupted`] under the engine's [`RetryPolicy`]: rate-limiter token →
//! pooled connection (if the route needs one) → handler inside the resource's circuit
//! breaker → connection release. Handler panics are caught and treated as transient
//! failures. A backoff sleep ends early when the batch is cancelled or the engine
//! shuts down.

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::batch_tracker::BatchTracker;
use super::handler::{HandlerRoute, JobContext};
use super::job_queue::JobQueue;
use super::retry::{retry_until_interrupted, RetryOutcome, RetryPolicy};
use crate::database::{ConnectionManager, ConnectionPool};
use crate::error::{EngineError, HandlerError, Result};
use crate::logging::log_error;
use crate::models::{BatchId, Job, JobFailure, JobOutcome};
use crate::utils::deadline_after;
use crate::resilience::{CircuitBreakerError, CircuitBreakerManager, RateLimiterRegistry};

/// A registered batch: its tracker plus the route its jobs run through
pub(crate) struct BatchEntry<C: Send + 'static> {
    pub(crate) tracker: Arc<BatchTracker>,
    pub(crate) route: HandlerRoute<C>,
}

/// Shared state every worker executes against
pub(crate) struct ExecutionContext<M: ConnectionManager> {
    pub(crate) queue: Arc<JobQueue>,
    pub(crate) batches: DashMap<BatchId, Arc<BatchEntry<M::Connection>>>,
    pub(crate) rate_limiters: RateLimiterRegistry,
    pub(crate) breakers: CircuitBreakerManager,
    pub(crate) pool: ConnectionPool<M>,
    pub(crate) retry: RetryPolicy,
    pub(crate) job_timeout: Option<Duration>,
    pub(crate) poll_interval: Duration,
    pub(crate) shutdown: watch::Sender<bool>,
}

impl<M: ConnectionManager> ExecutionContext<M> {
    pub(crate) fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Flag shutdown; returns `true` if it was already flagged
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.shutdown.send_replace(true)
    }

    /// Resolves with a reason once the batch is cancelled or the engine shuts down
    async fn interrupted(&self, tracker: &BatchTracker) -> String {
        let mut cancelled = tracker.cancel_signal();
        let mut shutdown = self.shutdown.subscribe();
        let reason = tokio::select! {
            biased;
            () = wait_until_set(&mut cancelled) => "batch cancelled between attempts",
            () = wait_until_set(&mut shutdown) => "engine shut down between attempts",
        };
        reason.to_string()
    }

    fn entry(&self, batch_id: BatchId) -> Option<Arc<BatchEntry<M::Connection>>> {
        self.batches
            .get(&batch_id)
            .map(|entry| Arc::clone(entry.value()))
    }
}

/// Running worker tasks
pub struct WorkerPool {
    size: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started_at: Instant,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("uptime", &self.started_at.elapsed())
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `size` workers on `runtime`. Callable from any thread.
    pub(crate) fn start<M: ConnectionManager>(
        size: usize,
        context: Arc<ExecutionContext<M>>,
        runtime: &Handle,
    ) -> Self {
        info!(worker_count = size, "🏊 POOL: Starting worker pool");
        let handles = (0..size)
            .map(|worker_id| runtime.spawn(worker_loop(worker_id, Arc::clone(&context))))
            .collect();

        Self {
            size,
            handles: Mutex::new(handles),
            started_at: Instant::now(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait up to `timeout` for every worker to exit, aborting stragglers.
    /// Returns `true` if all workers stopped on their own.
    pub async fn join(&self, timeout: Duration) -> bool {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        let deadline = deadline_after(timeout);
        let mut clean = true;

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => log_error("worker_pool", "join", &e.to_string(), None),
                Err(_) => {
                    handle.abort();
                    clean = false;
                }
            }
        }

        if clean {
            info!(worker_count = self.size, "✅ POOL: All workers stopped");
        } else {
            warn!(worker_count = self.size, "⚠️ POOL: Aborted workers that did not stop in time");
        }
        clean
    }
}

#[instrument(skip(context), name = "worker")]
async fn worker_loop<M: ConnectionManager>(worker_id: usize, context: Arc<ExecutionContext<M>>) {
    debug!(worker_id, "Worker started");

    while !context.is_shutting_down() {
        let job = match context.queue.dequeue(context.poll_interval).await {
            Ok(job) => job,
            Err(EngineError::DequeueTimeout(_)) => continue,
            Err(_) => break,
        };

        let Some(entry) = context.entry(job.batch_id) else {
            debug!(batch_id = %job.batch_id, job_id = %job.id, "Dropping job of forgotten batch");
            continue;
        };
        run_job(&context, &entry, job).await;
    }

    debug!(worker_id, "Worker stopped");
}

/// Claim, execute with retries, and record one job
async fn run_job<M: ConnectionManager>(
    context: &ExecutionContext<M>,
    entry: &BatchEntry<M::Connection>,
    job: Job,
) {
    let tracker = &entry.tracker;
    if !tracker.begin(job.index) {
        debug!(job_id = %job.id, batch_id = %job.batch_id, "Job not started, batch cancelled");
        return;
    }

    let report = retry_until_interrupted(
        &context.retry,
        |attempt| {
            tracker.record_attempt(job.index, attempt);
            attempt_job(context, &entry.route, &job, attempt)
        },
        || context.interrupted(tracker),
    )
    .await;

    let outcome = match report.outcome {
        RetryOutcome::Succeeded(value) => JobOutcome::Succeeded(value),
        RetryOutcome::Failed(error) => {
            warn!(
                job_id = %job.id,
                identifier = %job.identifier,
                attempts = report.attempts,
                error = %error,
                "Job failed"
            );
            JobOutcome::Failed(JobFailure::from(&error))
        }
        RetryOutcome::Interrupted(reason) => JobOutcome::Cancelled(reason),
    };
    tracker.finish(job.index, outcome, report.attempts, report.delays);
}

/// One pass through the pipeline
async fn attempt_job<M: ConnectionManager>(
    context: &ExecutionContext<M>,
    route: &HandlerRoute<M::Connection>,
    job: &Job,
    attempt: u32,
) -> Result<Value> {
    let bucket = context.rate_limiters.bucket(&route.resource);
    bucket.acquire(context.rate_limiters.acquire_timeout()).await?;

    let mut connection = if route.needs_connection {
        Some(context.pool.get().await?)
    } else {
        None
    };

    let job_context = JobContext {
        job_id: job.id,
        batch_id: job.batch_id,
        identifier: job.identifier.clone(),
        kind: job.kind,
        priority: job.priority,
        attempt,
        deadline: context.job_timeout.map(deadline_after),
    };

    let handler = Arc::clone(&route.handler);
    let connection_ref = connection.as_mut().and_then(|c| c.connection_mut());
    let invocation = async move {
        match AssertUnwindSafe(handler.execute(&job_context, connection_ref))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(HandlerError::transient(format!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            ))),
        }
    };

    let result = if context.breakers.is_enabled() {
        let breaker = context.breakers.get_circuit_breaker(&route.resource);
        breaker
            .call_filtered(move || invocation, |e: &HandlerError| !e.is_permanent())
            .await
    } else {
        invocation.await.map_err(CircuitBreakerError::OperationFailed)
    };

    let (result, healthy) = match result {
        Ok(value) => {
            bucket.record_success();
            (Ok(value), true)
        }
        Err(CircuitBreakerError::CircuitOpen { component }) => (
            Err(EngineError::CircuitOpen {
                resource: component,
            }),
            true,
        ),
        Err(CircuitBreakerError::OperationFailed(error)) => {
            if error.is_backpressure() {
                bucket.record_backpressure();
            }
            let healthy = !matches!(error, HandlerError::Transient(_));
            (Err(EngineError::from(error)), healthy)
        }
    };

    if let Some(connection) = connection {
        connection.release(healthy);
    }
    result
}

/// Wait until the flag reads `true`; never resolves if its sender is gone
async fn wait_until_set(flag: &mut watch::Receiver<bool>) {
    let closed = flag.wait_for(|set| *set).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
