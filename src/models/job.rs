//! Job model
//!
//! A [`Job`] is one identifier's lookup and the unit of scheduling. It is created by
//! the batch coordinator, owned by the job queue while pending, and moved into exactly
//! one worker once claimed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::state_machine::{JobEvent, JobState};

/// Unique job identifier, assigned at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique batch identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for BatchId {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| EngineError::BatchNotFound(s.to_string()))
    }
}

/// What kind of lookup a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Single search against the primary source
    BasicSearch,
    /// Full collection across every source for the identifier
    ComprehensiveCollection,
    /// Check that the identifier resolves, without collecting records
    ValidationOnly,
    /// Enrich an already-collected record
    Enhancement,
}

impl JobKind {
    pub const ALL: [JobKind; 4] = [
        JobKind::BasicSearch,
        JobKind::ComprehensiveCollection,
        JobKind::ValidationOnly,
        JobKind::Enhancement,
    ];
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BasicSearch => write!(f, "basic_search"),
            Self::ComprehensiveCollection => write!(f, "comprehensive_collection"),
            Self::ValidationOnly => write!(f, "validation_only"),
            Self::Enhancement => write!(f, "enhancement"),
        }
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "basic_search" => Ok(Self::BasicSearch),
            "comprehensive_collection" => Ok(Self::ComprehensiveCollection),
            "validation_only" => Ok(Self::ValidationOnly),
            "enhancement" => Ok(Self::Enhancement),
            _ => Err(format!("Invalid job kind: {s}")),
        }
    }
}

/// Scheduling priority. Declaration order gives `Low < Normal < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One unit of work as it sits in the queue.
///
/// A job carries no lifecycle state of its own; the batch tracker records its
/// state, attempts and timestamps as the single source of truth.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub batch_id: BatchId,
    /// Position of the job within its batch submission
    pub index: usize,
    pub identifier: String,
    pub kind: JobKind,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        batch_id: BatchId,
        index: usize,
        identifier: impl Into<String>,
        kind: JobKind,
        priority: Priority,
    ) -> Self {
        Self {
            id: JobId::new(),
            batch_id,
            index,
            identifier: identifier.into(),
            kind,
            priority,
            created_at: Utc::now(),
        }
    }
}

/// Classified failure attached to a Failed job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl From<&EngineError> for JobFailure {
    fn from(error: &EngineError) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// Terminal outcome of a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded(Value),
    Failed(JobFailure),
    Cancelled(String),
}

impl JobOutcome {
    /// The terminal state this outcome corresponds to
    pub fn state(&self) -> JobState {
        match self {
            Self::Succeeded(_) => JobState::Succeeded,
            Self::Failed(_) => JobState::Failed,
            Self::Cancelled(_) => JobState::Cancelled,
        }
    }

    pub fn event(&self) -> JobEvent {
        match self {
            Self::Succeeded(_) => JobEvent::Succeed,
            Self::Failed(_) => JobEvent::Fail,
            Self::Cancelled(_) => JobEvent::Cancel,
        }
    }
}

/// Per-identifier view of a job, as returned by `results()`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub identifier: String,
    pub kind: JobKind,
    pub priority: Priority,
    pub state: JobState,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Present once the job is terminal
    pub outcome: Option<JobOutcome>,
    /// Delays slept between attempts, in order
    pub backoff_delays: Vec<Duration>,
}

impl JobResult {
    pub fn pending(job: &Job) -> Self {
        Self {
            job_id: job.id,
            identifier: job.identifier.clone(),
            kind: job.kind,
            priority: job.priority,
            state: JobState::Pending,
            attempts: 0,
            created_at: job.created_at,
            started_at: None,
            finished_at: None,
            outcome: None,
            backoff_delays: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_pending_result_mirrors_job() {
        let job = Job::new(
            BatchId::new(),
            3,
            "123-456-789",
            JobKind::BasicSearch,
            Priority::High,
        );
        let result = JobResult::pending(&job);
        assert_eq!(result.job_id, job.id);
        assert_eq!(result.identifier, "123-456-789");
        assert_eq!(result.priority, Priority::High);
        assert_eq!(result.state, JobState::Pending);
        assert_eq!(result.attempts, 0);
        assert!(result.started_at.is_none());
        assert!(result.outcome.is_none());
        assert!(!result.is_terminal());
    }

    #[test]
    fn test_job_kind_parsing() {
        for kind in JobKind::ALL {
            assert_eq!(kind.to_string().parse::<JobKind>(), Ok(kind));
        }
        assert!("scrape_everything".parse::<JobKind>().is_err());
    }

    #[test]
    fn test_failure_from_engine_error() {
        let failure = JobFailure::from(&EngineError::CircuitOpen {
            resource: "scrape:treasurer".to_string(),
        });
        assert_eq!(failure.code, "CIRCUIT_OPEN");
        assert!(failure.retryable);
    }
}
