//! # Orchestration Engine
//!
//! Batch scheduling and execution for identifier lookups.
//!
//! ## Architecture
//!
//! A caller submits a batch through the [`BatchCoordinator`]. The coordinator turns
//! each identifier into a [`Job`](crate::models::Job), registers a
//! [`BatchTracker`] for aggregate progress, and enqueues the jobs on the shared
//! [`JobQueue`]. A fixed [`WorkerPool`] pulls jobs in priority order and runs each one
//! through the same pipeline:
//!
//! 1. Claim the job on its batch tracker (jobs of a cancelled batch never start)
//! 2. Acquire a rate-limiter token for the handler's resource
//! 3. Acquire a pooled connection if the handler needs one
//! 4. Invoke the handler inside the resource's circuit breaker
//! 5. Release the connection, retry per [`RetryPolicy`] or record the terminal outcome
//!
//! ## Core Components
//!
//! - **JobQueue**: Priority queue with FIFO ordering inside a tier and exactly-once delivery
//! - **RetryPolicy**: Exponential backoff with jitter, shared by every worker
//! - **HandlerRegistry**: Resolves a [`JobKind`](crate::models::JobKind) to its handler route
//! - **BatchTracker**: Single owner of one batch's counters, results and progress sink
//! - **WorkerPool**: Worker tasks plus the per-job execution pipeline
//! - **BatchCoordinator**: Public entry point (`submit`, `status`, `results`, `cancel`)

pub mod batch_coordinator;
pub mod batch_tracker;
pub mod handler;
pub mod job_queue;
pub mod progress;
pub mod resource_limits;
pub mod retry;
pub mod worker_pool;

pub use batch_coordinator::{BatchCoordinator, BatchRequest, EngineStats};
pub use batch_tracker::BatchTracker;
pub use handler::{FnHandler, HandlerRegistry, HandlerRoute, JobContext, JobHandler};
pub use job_queue::JobQueue;
pub use progress::{
    ChannelProgressSink, FnProgressSink, ProgressEvent, ProgressSink, TracingProgressSink,
};
pub use resource_limits::{SystemResources, WorkerSizing};
pub use retry::{
    retry_until_interrupted, retry_with_backoff, BackoffCalculator, RetryOutcome, RetryPolicy,
    RetryReport,
};
pub use worker_pool::WorkerPool;
