pub mod batch;
pub mod job;

// Re-export core models for easy access
pub use batch::{BatchCounters, BatchSnapshot};
pub use job::{BatchId, Job, JobFailure, JobId, JobKind, JobOutcome, JobResult, Priority};
