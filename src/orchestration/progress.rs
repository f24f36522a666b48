//! Progress reporting
//!
//! A batch may carry one [`ProgressSink`]. The batch tracker invokes it once per job
//! terminal transition, from the worker that finished the job and outside any engine
//! lock. Sinks must return quickly.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::models::{BatchId, JobId};
use crate::state_machine::JobState;

/// One job reached a terminal state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub batch_id: BatchId,
    pub job_id: JobId,
    pub identifier: String,
    pub state: JobState,
    /// Batch-wide terminal job count including this job
    pub completed: usize,
    pub total: usize,
}

impl ProgressEvent {
    pub fn is_last(&self) -> bool {
        self.completed == self.total
    }
}

/// Receives per-job progress for a batch
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: &ProgressEvent);
}

/// Closure-backed sink
pub struct FnProgressSink<F>(F);

impl<F> FnProgressSink<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> ProgressSink for FnProgressSink<F>
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: &ProgressEvent) {
        (self.0)(event)
    }
}

/// Forwards events into an unbounded channel for a consumer on another task
#[derive(Debug, Clone)]
pub struct ChannelProgressSink {
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelProgressSink {
    pub fn new(sender: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        Self { sender }
    }

    /// Create a sink together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn on_progress(&self, event: &ProgressEvent) {
        if self.sender.send(event.clone()).is_err() {
            debug!(batch_id = %event.batch_id, "Progress receiver dropped, event discarded");
        }
    }
}

/// Logs every event at info level
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_progress(&self, event: &ProgressEvent) {
        info!(
            batch_id = %event.batch_id,
            job_id = %event.job_id,
            identifier = %event.identifier,
            state = %event.state,
            completed = event.completed,
            total = event.total,
            "📊 PROGRESS"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn event(completed: usize, total: usize) -> ProgressEvent {
        ProgressEvent {
            batch_id: BatchId::new(),
            job_id: JobId::new(),
            identifier: "123 Main St".to_string(),
            state: JobState::Succeeded,
            completed,
            total,
        }
    }

    #[test]
    fn test_fn_sink_invoked() {
        let count = Arc::new(AtomicUsize::new(0));
        let sink = {
            let count = Arc::clone(&count);
            FnProgressSink::new(move |_event: &ProgressEvent| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };
        sink.on_progress(&event(1, 2));
        sink.on_progress(&event(2, 2));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_channel_sink_delivers_and_survives_dropped_receiver() {
        let (sink, mut receiver) = ChannelProgressSink::channel();
        sink.on_progress(&event(1, 1));
        let received = receiver.recv().await.unwrap();
        assert!(received.is_last());

        drop(receiver);
        sink.on_progress(&event(1, 1));
    }
}
