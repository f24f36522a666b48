#![allow(clippy::doc_markdown)] // Allow technical terms like APN in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Lookup Engine
//!
//! Batch job coordination engine for concurrent property record lookups.
//!
//! ## Overview
//!
//! A caller submits a batch of identifiers (APNs, addresses, owner names) together
//! with a lookup handler. The engine turns each identifier into a job, schedules the
//! jobs by priority over a fixed pool of async workers, and runs every lookup behind a
//! per-resource token bucket, a pooled connection and a per-resource circuit breaker.
//! Failures are classified, retried with exponential backoff and jitter, and reported
//! per identifier, so one bad identifier never takes the batch down.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - Job queue, worker pool, batch tracking and the public coordinator
//! - [`resilience`] - Token buckets and circuit breakers per named resource
//! - [`database`] - Bounded pool of validated resource handles
//! - [`models`] - Jobs, batches, results
//! - [`state_machine`] - Job lifecycle transitions
//! - [`config`] - Engine configuration and its loader
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured `tracing` setup and helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lookup_engine::{
//!     BatchCoordinator, BatchRequest, EngineConfig, FnHandler, HandlerError, HandlerRegistry,
//!     HandlerRoute, JobContext, JobKind, Priority,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let handlers = HandlerRegistry::new().with_route(
//!     JobKind::BasicSearch,
//!     HandlerRoute::new(
//!         Arc::new(FnHandler::new(|ctx: JobContext| async move {
//!             Ok::<_, HandlerError>(serde_json::json!({ "apn": ctx.identifier }))
//!         })),
//!         "api",
//!     ),
//! );
//!
//! let engine = BatchCoordinator::without_connections(EngineConfig::default(), handlers)?;
//! let batch_id = engine.submit(
//!     BatchRequest::new(["101-22-333", "101-22-334"], JobKind::BasicSearch)
//!         .with_priority(Priority::High)
//!         .with_concurrency(4),
//! )?;
//!
//! let snapshot = engine.wait(batch_id, Duration::from_secs(60)).await?;
//! println!("{} of {} succeeded", snapshot.succeeded(), snapshot.total());
//! engine.shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! cargo bench --features benchmarks
//! ```

pub mod config;
pub mod database;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod resilience;
pub mod state_machine;
pub mod utils;

pub use config::{ConfigLoader, EngineConfig};
pub use database::{ConnectionError, ConnectionManager, ConnectionPool, PoolConfig};
pub use error::{EngineError, HandlerError, Result};
pub use models::{
    BatchId, BatchSnapshot, Job, JobFailure, JobId, JobKind, JobOutcome, JobResult, Priority,
};
pub use orchestration::{
    BatchCoordinator, BatchRequest, ChannelProgressSink, EngineStats, FnHandler, FnProgressSink,
    HandlerRegistry, HandlerRoute, JobContext, JobHandler, ProgressEvent, ProgressSink,
    RetryPolicy, TracingProgressSink,
};
pub use state_machine::{BatchStatus, JobState};
