//! # Batch Coordinator
//!
//! Public entry point of the engine. A submission becomes one [`Job`] per identifier,
//! a [`BatchTracker`] and a set of queued jobs; `submit` returns the batch id without
//! waiting for any job to run. Status and results are read from the tracker and are
//! available while the batch is still running.
//!
//! The worker pool is started by the first submission and shared by every later one.
//! Workers run on the tokio runtime captured when the coordinator is built, so
//! `submit`, `status`, `results` and `cancel` may be called from any thread, including
//! threads that are not part of a runtime.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use super::batch_tracker::BatchTracker;
use super::handler::{HandlerRegistry, HandlerRoute, JobHandler};
use super::job_queue::JobQueue;
use super::progress::ProgressSink;
use super::resource_limits::WorkerSizing;
use super::worker_pool::{BatchEntry, ExecutionContext, WorkerPool};
use crate::config::EngineConfig;
use crate::database::{ConnectionManager, ConnectionPool, NoopConnectionManager, PoolStats};
use crate::error::{EngineError, Result};
use crate::logging::log_batch_operation;
use crate::models::{BatchId, BatchSnapshot, Job, JobKind, JobResult, Priority};
use crate::resilience::{
    CircuitBreakerManager, CircuitBreakerMetrics, RateLimiterRegistry, RateLimiterSnapshot,
};

/// A batch submission
pub struct BatchRequest<C: Send + 'static = ()> {
    identifiers: Vec<String>,
    kind: JobKind,
    priority: Priority,
    concurrency: Option<usize>,
    route: Option<HandlerRoute<C>>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl<C: Send + 'static> BatchRequest<C> {
    pub fn new<I, S>(identifiers: I, kind: JobKind) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            identifiers: identifiers.into_iter().map(Into::into).collect(),
            kind,
            priority: Priority::default(),
            concurrency: None,
            route: None,
            progress: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Worker count to start the pool with, if this submission starts it
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    /// Run this batch with `handler` under `resource` instead of the registered route
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler<C>>, resource: impl Into<String>) -> Self {
        self.route = Some(HandlerRoute::new(handler, resource));
        self
    }

    pub fn with_route(mut self, route: HandlerRoute<C>) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.identifiers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identifiers.is_empty()
    }
}

/// Engine-wide statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub queue_depth: usize,
    pub worker_count: usize,
    pub tracked_batches: usize,
    pub active_batches: usize,
    pub pool: PoolStats,
    pub rate_limiters: BTreeMap<String, RateLimiterSnapshot>,
    pub circuit_breakers: BTreeMap<String, CircuitBreakerMetrics>,
}

/// Accepts batch submissions and reports on them
pub struct BatchCoordinator<M: ConnectionManager = NoopConnectionManager> {
    config: EngineConfig,
    handlers: HandlerRegistry<M::Connection>,
    context: Arc<ExecutionContext<M>>,
    workers: Mutex<Option<Arc<WorkerPool>>>,
    runtime: Handle,
}

impl<M: ConnectionManager> std::fmt::Debug for BatchCoordinator<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchCoordinator")
            .field("handlers", &self.handlers)
            .field("queue_depth", &self.context.queue.len())
            .field("batches", &self.context.batches.len())
            .finish()
    }
}

impl BatchCoordinator<NoopConnectionManager> {
    /// Coordinator whose handlers need no pooled connection
    pub fn without_connections(
        config: EngineConfig,
        handlers: HandlerRegistry<()>,
    ) -> Result<Self> {
        Self::new(config, handlers, NoopConnectionManager)
    }
}

impl<M: ConnectionManager> BatchCoordinator<M> {
    /// Build a coordinator whose workers run on the current tokio runtime.
    ///
    /// Fails with [`EngineError::RuntimeUnavailable`] when called outside a runtime;
    /// use [`BatchCoordinator::with_runtime`] to name one explicitly.
    pub fn new(
        config: EngineConfig,
        handlers: HandlerRegistry<M::Connection>,
        manager: M,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| EngineError::RuntimeUnavailable)?;
        Self::with_runtime(config, handlers, manager, runtime)
    }

    /// Build a coordinator whose workers run on `runtime`
    pub fn with_runtime(
        config: EngineConfig,
        handlers: HandlerRegistry<M::Connection>,
        manager: M,
        runtime: Handle,
    ) -> Result<Self> {
        config.validate()?;

        let pool = ConnectionPool::new(manager, config.pool.to_pool_config())?;
        let context = Arc::new(ExecutionContext {
            queue: Arc::new(JobQueue::new()),
            batches: DashMap::new(),
            rate_limiters: RateLimiterRegistry::new(config.rate_limits.clone()),
            breakers: CircuitBreakerManager::new(config.circuit_breakers.clone()),
            pool,
            retry: config.retry.to_retry_policy(),
            job_timeout: config.job_timeout(),
            poll_interval: config.workers.dequeue_poll_interval(),
            shutdown: watch::channel(false).0,
        });

        info!(
            handlers = ?handlers.kinds(),
            max_attempts = context.retry.max_attempts,
            "✅ COORDINATOR: Batch coordinator initialized"
        );

        Ok(Self {
            config,
            handlers,
            context,
            workers: Mutex::new(None),
            runtime,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handlers(&self) -> &HandlerRegistry<M::Connection> {
        &self.handlers
    }

    /// Register or replace the route for a job kind
    pub fn register_handler(&self, kind: JobKind, route: HandlerRoute<M::Connection>) {
        self.handlers.register(kind, route);
    }

    /// Pre-open `pool.min_size` connections
    pub async fn warm_up(&self) -> Result<usize> {
        self.context.pool.warm_up().await
    }

    /// Create and enqueue one job per identifier. Returns without waiting for any job.
    #[instrument(skip(self, request), fields(kind = %request.kind, total = request.len()))]
    pub fn submit(&self, request: BatchRequest<M::Connection>) -> Result<BatchId> {
        if self.context.is_shutting_down() {
            return Err(EngineError::EngineShutdown);
        }
        if request.concurrency == Some(0) {
            return Err(EngineError::InvalidConfiguration(
                "concurrency must be at least 1".to_string(),
            ));
        }

        let route = match request.route {
            Some(route) => route,
            None => self.handlers.resolve(request.kind)?,
        };

        let batch_id = BatchId::new();
        let jobs: Vec<Job> = request
            .identifiers
            .into_iter()
            .enumerate()
            .map(|(index, identifier)| {
                Job::new(batch_id, index, identifier, request.kind, request.priority)
            })
            .collect();
        let total = jobs.len();

        let tracker = Arc::new(BatchTracker::new(
            batch_id,
            request.kind,
            &jobs,
            request.progress,
        ));
        self.context.batches.insert(
            batch_id,
            Arc::new(BatchEntry {
                tracker,
                route,
            }),
        );

        if total > 0 {
            self.ensure_workers(request.concurrency);
            if let Err(e) = self.context.queue.enqueue_all(jobs) {
                self.context.batches.remove(&batch_id);
                return Err(e);
            }
        }

        log_batch_operation(
            "submit",
            batch_id,
            Some(total),
            "accepted",
            Some(&format!("priority={}", request.priority)),
        );
        Ok(batch_id)
    }

    /// Start the worker pool if it is not running yet
    fn ensure_workers(&self, requested: Option<usize>) {
        let mut workers = self.workers.lock();
        if let Some(pool) = workers.as_ref() {
            if let Some(requested) = requested.filter(|r| *r != pool.size()) {
                debug!(
                    requested,
                    running = pool.size(),
                    "Worker pool already running, reusing it"
                );
            }
            return;
        }

        let max_workers = self.config.workers.max_workers;
        let size = match requested.or(self.config.workers.worker_count) {
            Some(count) if count > max_workers => {
                warn!(requested = count, max_workers, "Concurrency capped at max_workers");
                max_workers
            }
            Some(count) => count,
            None => WorkerSizing::auto(&self.config.workers).worker_count,
        };

        *workers = Some(Arc::new(WorkerPool::start(
            size,
            Arc::clone(&self.context),
            &self.runtime,
        )));
    }

    fn entry(&self, batch_id: BatchId) -> Result<Arc<BatchEntry<M::Connection>>> {
        self.context
            .batches
            .get(&batch_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.to_string()))
    }

    /// Consistent snapshot of a batch's counters and elapsed time
    pub fn status(&self, batch_id: BatchId) -> Result<BatchSnapshot> {
        Ok(self.entry(batch_id)?.tracker.snapshot())
    }

    /// One entry per submitted identifier, in submission order
    pub fn results(&self, batch_id: BatchId) -> Result<Vec<JobResult>> {
        Ok(self.entry(batch_id)?.tracker.results())
    }

    /// Cancel a batch: queued jobs are removed and recorded Cancelled, dequeued jobs
    /// that have not started never start, running jobs finish and count as Cancelled.
    #[instrument(skip(self))]
    pub fn cancel(&self, batch_id: BatchId) -> Result<BatchSnapshot> {
        let entry = self.entry(batch_id)?;
        if entry.tracker.request_cancel() {
            let removed = self.context.queue.remove_batch(batch_id);
            entry.tracker.cancel_queued(&removed);
            log_batch_operation(
                "cancel",
                batch_id,
                None,
                "cancelling",
                Some(&format!("removed_queued={}", removed.len())),
            );
        }
        Ok(entry.tracker.snapshot())
    }

    /// Wait up to `timeout` for the batch to reach Completed or Cancelled
    pub async fn wait(&self, batch_id: BatchId, timeout: Duration) -> Result<BatchSnapshot> {
        let entry = self.entry(batch_id)?;
        entry.tracker.wait(timeout).await
    }

    /// Drop a batch from the registry. Its queued jobs are discarded, running jobs
    /// finish unaffected, and its progress sink receives nothing further.
    pub fn forget(&self, batch_id: BatchId) -> Result<BatchSnapshot> {
        let (_, entry) = self
            .context
            .batches
            .remove(&batch_id)
            .ok_or_else(|| EngineError::BatchNotFound(batch_id.to_string()))?;
        entry.tracker.detach_sink();
        let discarded = self.context.queue.remove_batch(batch_id);
        entry.tracker.cancel_queued(&discarded);
        debug!(batch_id = %batch_id, discarded = discarded.len(), "Batch forgotten");
        Ok(entry.tracker.snapshot())
    }

    pub fn batch_ids(&self) -> Vec<BatchId> {
        self.context
            .batches
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn stats(&self) -> EngineStats {
        let tracked_batches = self.context.batches.len();
        let active_batches = self
            .context
            .batches
            .iter()
            .filter(|entry| !entry.value().tracker.is_done())
            .count();

        EngineStats {
            queue_depth: self.context.queue.len(),
            worker_count: self.workers.lock().as_ref().map_or(0, |pool| pool.size()),
            tracked_batches,
            active_batches,
            pool: self.context.pool.stats(),
            rate_limiters: self.context.rate_limiters.snapshots(),
            circuit_breakers: self.context.breakers.all_metrics(),
        }
    }

    pub fn circuit_breakers(&self) -> &CircuitBreakerManager {
        &self.context.breakers
    }

    pub fn rate_limiters(&self) -> &RateLimiterRegistry {
        &self.context.rate_limiters
    }

    /// [`shutdown`](Self::shutdown) with `workers.shutdown_timeout_ms` from the config
    pub async fn shutdown_gracefully(&self) -> Result<()> {
        self.shutdown(self.config.workers.shutdown_timeout()).await
    }

    /// Stop accepting work, cancel queued jobs and wait up to `timeout` for running
    /// jobs to finish. Jobs waiting out a retry backoff stop at once and end
    /// Cancelled; jobs still running at the deadline are recorded Cancelled.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.context.begin_shutdown() {
            return Ok(());
        }
        info!("🛑 COORDINATOR: Shutting down");

        let drained = self.context.queue.close();
        for job in &drained {
            if let Some(entry) = self.context.batches.get(&job.batch_id) {
                entry.tracker.cancel_queued(std::slice::from_ref(job));
            }
        }

        let workers = self.workers.lock().take();
        let clean = match workers {
            Some(pool) => pool.join(timeout).await,
            None => true,
        };

        if !clean {
            for entry in self.context.batches.iter() {
                let abandoned = entry
                    .value()
                    .tracker
                    .abandon_unfinished("engine shut down before the job finished");
                if abandoned > 0 {
                    warn!(batch_id = %entry.key(), abandoned, "Abandoned unfinished jobs");
                }
            }
        }
        self.context.pool.close();

        info!(
            cancelled_queued = drained.len(),
            clean, "✅ COORDINATOR: Shutdown complete"
        );
        if clean {
            Ok(())
        } else {
            Err(EngineError::Timeout(timeout))
        }
    }
}

impl<M: ConnectionManager> Drop for BatchCoordinator<M> {
    fn drop(&mut self) {
        if !self.context.begin_shutdown() {
            self.context.queue.close();
        }
    }
}
