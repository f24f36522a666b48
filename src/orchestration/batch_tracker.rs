//! # Batch Tracker
//!
//! Single owner of one batch's aggregate state. Counters, per-job results, the
//! cancellation flag and the progress sink live behind one lock, so every `status()`
//! read is a consistent snapshot and every job terminal transition updates the
//! counters exactly once.
//!
//! The cancellation flag is checked in [`BatchTracker::begin`] under the same lock
//! that [`BatchTracker::request_cancel`] sets it with. Once `request_cancel` returns,
//! no job of the batch can move Pending → Running.
//!
//! Progress events are queued under the state lock in the order jobs finish and
//! delivered by one thread at a time, so a sink sees `completed` counts in order.
//! After [`BatchTracker::detach_sink`] returns the sink receives nothing further.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::progress::{ProgressEvent, ProgressSink};
use crate::error::{EngineError, Result};
use crate::logging::log_job_operation;
use crate::models::{BatchCounters, BatchId, BatchSnapshot, Job, JobKind, JobOutcome, JobResult};
use crate::state_machine::{self, BatchStatus, JobEvent, JobState};

const CANCELLED_BEFORE_START: &str = "batch cancelled before the job started";
const CANCELLED_WHILE_RUNNING: &str = "batch cancelled while the job was running; result discarded";

struct TrackerState {
    counters: BatchCounters,
    results: Vec<JobResult>,
    cancel_requested: bool,
    sink: Option<Arc<dyn ProgressSink>>,
    /// Events waiting for delivery, oldest first
    outbox: VecDeque<ProgressEvent>,
    finished_after: Option<Duration>,
}

impl TrackerState {
    fn status(&self) -> BatchStatus {
        if !self.counters.is_done() {
            BatchStatus::Active
        } else if self.cancel_requested {
            BatchStatus::Cancelled
        } else {
            BatchStatus::Completed
        }
    }
}

/// Aggregate progress for one batch
pub struct BatchTracker {
    batch_id: BatchId,
    kind: JobKind,
    submitted_at: DateTime<Utc>,
    started: Instant,
    state: Mutex<TrackerState>,
    /// Held while events are handed to the sink; reentrant so a sink may call back in
    delivery: ReentrantMutex<()>,
    done: watch::Sender<bool>,
    cancelled: watch::Sender<bool>,
}

impl std::fmt::Debug for BatchTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchTracker")
            .field("batch_id", &self.batch_id)
            .field("counters", &self.state.lock().counters)
            .finish()
    }
}

impl BatchTracker {
    /// Track `jobs`, indexed by [`Job::index`]
    pub fn new(
        batch_id: BatchId,
        kind: JobKind,
        jobs: &[Job],
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Self {
        let counters = BatchCounters::new(jobs.len());
        let results = jobs.iter().map(JobResult::pending).collect();
        let (done, _) = watch::channel(counters.is_done());
        let (cancelled, _) = watch::channel(false);

        Self {
            batch_id,
            kind,
            submitted_at: Utc::now(),
            started: Instant::now(),
            state: Mutex::new(TrackerState {
                counters,
                results,
                cancel_requested: false,
                sink,
                outbox: VecDeque::new(),
                finished_after: counters.is_done().then_some(Duration::ZERO),
            }),
            delivery: ReentrantMutex::new(()),
            done,
            cancelled,
        }
    }

    pub fn batch_id(&self) -> BatchId {
        self.batch_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Claim a dequeued job for execution.
    ///
    /// Returns `false` when the job must not run: its batch was cancelled (the job is
    /// recorded Cancelled here) or it already reached a terminal state.
    pub fn begin(&self, index: usize) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let cancel_requested = state.cancel_requested;
        let Some(record) = state.results.get_mut(index) else {
            warn!(batch_id = %self.batch_id, index, "Unknown job index");
            return false;
        };
        if record.state != JobState::Pending {
            return false;
        }
        if cancel_requested {
            drop(guard);
            self.finish(
                index,
                JobOutcome::Cancelled(CANCELLED_BEFORE_START.to_string()),
                0,
                Vec::new(),
            );
            return false;
        }

        record.state = JobState::Running;
        record.started_at = Some(Utc::now());
        state.counters.record_started();
        true
    }

    /// Publish the attempt count of a running job
    pub fn record_attempt(&self, index: usize, attempt: u32) {
        let mut state = self.state.lock();
        if let Some(record) = state.results.get_mut(index) {
            if !record.is_terminal() {
                record.attempts = record.attempts.max(attempt);
            }
        }
    }

    /// Record a job's terminal outcome.
    ///
    /// A second outcome for the same job is ignored and returns `false`. When the batch
    /// was cancelled while the job ran, success or failure is recorded as Cancelled.
    pub fn finish(
        &self,
        index: usize,
        outcome: JobOutcome,
        attempts: u32,
        backoff_delays: Vec<Duration>,
    ) -> bool {
        let (event, detail, now_done) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let cancel_requested = state.cancel_requested;
            let Some(record) = state.results.get_mut(index) else {
                warn!(batch_id = %self.batch_id, index, "Unknown job index");
                return false;
            };

            let outcome = match outcome {
                JobOutcome::Succeeded(_) | JobOutcome::Failed(_) if cancel_requested => {
                    JobOutcome::Cancelled(CANCELLED_WHILE_RUNNING.to_string())
                }
                other => other,
            };

            let from = record.state;
            let to = match state_machine::transition(from, outcome.event()) {
                Ok(to) => to,
                Err(e) => {
                    debug!(batch_id = %self.batch_id, index, error = %e, "Ignoring outcome");
                    return false;
                }
            };

            let detail = match &outcome {
                JobOutcome::Succeeded(_) => None,
                JobOutcome::Failed(failure) => Some(failure.message.clone()),
                JobOutcome::Cancelled(reason) => Some(reason.clone()),
            };
            record.state = to;
            record.attempts = record.attempts.max(attempts);
            record.finished_at = Some(Utc::now());
            record.backoff_delays = backoff_delays;
            record.outcome = Some(outcome);

            let event = ProgressEvent {
                batch_id: self.batch_id,
                job_id: record.job_id,
                identifier: record.identifier.clone(),
                state: to,
                completed: state.counters.completed + 1,
                total: state.counters.total,
            };
            state.counters.record_terminal(from, to);
            if state.sink.is_some() {
                state.outbox.push_back(event.clone());
            }

            let now_done = state.counters.is_done();
            if now_done {
                state.finished_after = Some(self.started.elapsed());
            }
            (event, detail, now_done)
        };

        log_job_operation(
            "finish",
            event.job_id,
            self.batch_id,
            &event.identifier,
            &event.state.to_string(),
            detail.as_deref(),
        );
        self.deliver_progress();

        if now_done {
            let status = self.state.lock().status();
            info!(
                batch_id = %self.batch_id,
                status = %status,
                total = event.total,
                "🏁 BATCH: All jobs reached a terminal state"
            );
            self.done.send_replace(true);
        }
        true
    }

    /// Hand queued events to the sink in order. The state lock is never held while
    /// the sink runs.
    fn deliver_progress(&self) {
        let _delivery = self.delivery.lock();
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.sink.clone() {
                    Some(sink) => state.outbox.pop_front().map(|event| (sink, event)),
                    None => {
                        state.outbox.clear();
                        None
                    }
                }
            };
            let Some((sink, event)) = next else {
                break;
            };
            sink.on_progress(&event);
        }
    }

    /// Set the cancellation flag. Returns `false` if it was already set or every job
    /// is already terminal.
    pub fn request_cancel(&self) -> bool {
        let mut state = self.state.lock();
        if state.cancel_requested || state.counters.is_done() {
            return false;
        }
        state.cancel_requested = true;
        self.cancelled.send_replace(true);
        true
    }

    /// Receiver that observes `true` once cancellation is requested
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancelled.subscribe()
    }

    /// Record queued jobs removed by cancellation
    pub fn cancel_queued(&self, jobs: &[Job]) {
        for job in jobs {
            self.finish(
                job.index,
                JobOutcome::Cancelled(CANCELLED_BEFORE_START.to_string()),
                0,
                Vec::new(),
            );
        }
    }

    /// End every non-terminal job as Cancelled with `reason`; returns how many changed
    pub fn abandon_unfinished(&self, reason: &str) -> usize {
        let open: Vec<usize> = {
            let state = self.state.lock();
            state
                .results
                .iter()
                .enumerate()
                .filter(|(_, record)| !record.is_terminal())
                .map(|(index, _)| index)
                .collect()
        };
        open.into_iter()
            .filter(|index| {
                self.finish(
                    *index,
                    JobOutcome::Cancelled(reason.to_string()),
                    0,
                    Vec::new(),
                )
            })
            .count()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state.lock().cancel_requested
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().counters.is_done()
    }

    /// Stop delivering progress events. Waits for an in-flight delivery to return,
    /// so no event reaches the sink once this returns.
    pub fn detach_sink(&self) {
        let _delivery = self.delivery.lock();
        let mut state = self.state.lock();
        state.sink = None;
        state.outbox.clear();
    }

    pub fn snapshot(&self) -> BatchSnapshot {
        let state = self.state.lock();
        BatchSnapshot {
            batch_id: self.batch_id,
            status: state.status(),
            counters: state.counters,
            submitted_at: self.submitted_at,
            elapsed: state
                .finished_after
                .unwrap_or_else(|| self.started.elapsed()),
            cancellation_requested: state.cancel_requested,
        }
    }

    /// Per-identifier results in submission order, including jobs still in flight
    pub fn results(&self) -> Vec<JobResult> {
        self.state.lock().results.clone()
    }

    /// Wait up to `timeout` for every job to reach a terminal state
    pub async fn wait(&self, timeout: Duration) -> Result<BatchSnapshot> {
        let mut done = self.done.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, done.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        if reached {
            Ok(self.snapshot())
        } else {
            Err(EngineError::Timeout(timeout))
        }
    }
}
