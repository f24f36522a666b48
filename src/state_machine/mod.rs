//! # Job State Machine
//!
//! `Pending → Running → {Succeeded, Failed, Cancelled}`, plus `Pending → Cancelled`
//! for jobs that never started. Nothing leaves a terminal state.

pub mod events;
pub mod states;

pub use events::JobEvent;
pub use states::{BatchStatus, JobState};

use crate::error::{EngineError, Result};

/// Resolve the state a job moves to when `event` is applied in state `from`
pub fn transition(from: JobState, event: JobEvent) -> Result<JobState> {
    let next = match (from, event) {
        (JobState::Pending, JobEvent::Start) => JobState::Running,
        (JobState::Pending, JobEvent::Cancel) => JobState::Cancelled,
        (JobState::Running, JobEvent::Succeed) => JobState::Succeeded,
        (JobState::Running, JobEvent::Fail) => JobState::Failed,
        (JobState::Running, JobEvent::Cancel) => JobState::Cancelled,
        _ => return Err(EngineError::InvalidStateTransition { from, event }),
    };
    Ok(next)
}
