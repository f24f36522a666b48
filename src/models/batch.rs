//! Batch aggregate counters and status snapshots

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::job::BatchId;
use crate::state_machine::{BatchStatus, JobState};

/// Aggregate job counters for a batch
///
/// `completed == succeeded + failed + cancelled` holds after every update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCounters {
    pub total: usize,
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub running: usize,
}

impl BatchCounters {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Count a job entering a terminal state, coming from `from`
    pub fn record_terminal(&mut self, from: JobState, to: JobState) {
        debug_assert!(to.is_terminal());
        if from == JobState::Running {
            self.running = self.running.saturating_sub(1);
        }
        match to {
            JobState::Succeeded => self.succeeded += 1,
            JobState::Failed => self.failed += 1,
            JobState::Cancelled => self.cancelled += 1,
            JobState::Pending | JobState::Running => return,
        }
        self.completed += 1;
    }

    pub fn record_started(&mut self) {
        self.running += 1;
    }

    pub fn pending(&self) -> usize {
        self.total - self.completed - self.running
    }

    pub fn is_done(&self) -> bool {
        self.completed == self.total
    }
}

/// Consistent point-in-time view of a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub counters: BatchCounters,
    pub submitted_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub cancellation_requested: bool,
}

impl BatchSnapshot {
    pub fn total(&self) -> usize {
        self.counters.total
    }

    pub fn completed(&self) -> usize {
        self.counters.completed
    }

    pub fn succeeded(&self) -> usize {
        self.counters.succeeded
    }

    pub fn failed(&self) -> usize {
        self.counters.failed
    }

    pub fn cancelled(&self) -> usize {
        self.counters.cancelled
    }

    /// Fraction of jobs in a terminal state (1.0 for an empty batch)
    pub fn progress(&self) -> f64 {
        if self.counters.total == 0 {
            1.0
        } else {
            self.counters.completed as f64 / self.counters.total as f64
        }
    }
}
