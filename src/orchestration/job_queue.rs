//! # Job Queue
//!
//! Priority queue of pending jobs shared by every worker.
//!
//! Jobs are ordered by priority tier (Critical first) and by insertion order inside a
//! tier. A job popped by `dequeue` is removed under the queue lock, so no job is ever
//! handed to two workers. `remove` and `remove_batch` take the same lock and are safe to
//! call while workers are dequeuing.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::models::{BatchId, Job, JobId, Priority};
use crate::utils::deadline_after;

/// Sort key: higher priority first, then lower sequence number first
type QueueKey = (Reverse<Priority>, u64);

#[derive(Default)]
struct QueueState {
    entries: BTreeMap<QueueKey, Job>,
    index: HashMap<JobId, QueueKey>,
    next_seq: u64,
    closed: bool,
}

impl QueueState {
    fn pop_first(&mut self) -> Option<Job> {
        let (_, job) = self.entries.pop_first()?;
        self.index.remove(&job.id);
        Some(job)
    }
}

/// Thread-safe priority queue with blocking dequeue
#[derive(Default)]
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Notify,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JobQueue")
            .field("len", &state.entries.len())
            .field("closed", &state.closed)
            .finish()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job behind every queued job of the same or higher priority
    pub fn enqueue(&self, job: Job) -> Result<()> {
        self.enqueue_all(std::iter::once(job)).map(|_| ())
    }

    /// Insert jobs in iteration order, returning how many were queued
    pub fn enqueue_all(&self, jobs: impl IntoIterator<Item = Job>) -> Result<usize> {
        let mut inserted = 0;
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(EngineError::QueueClosed);
            }
            for job in jobs {
                let key = (Reverse(job.priority), state.next_seq);
                state.next_seq += 1;
                state.index.insert(job.id, key);
                state.entries.insert(key, job);
                inserted += 1;
            }
        }
        for _ in 0..inserted {
            self.available.notify_one();
        }
        Ok(inserted)
    }

    /// Pop the best job if one is queued right now
    pub fn try_dequeue(&self) -> Option<Job> {
        self.state.lock().pop_first()
    }

    /// Pop the best job, waiting up to `timeout` for one to be enqueued.
    ///
    /// Fails with [`EngineError::DequeueTimeout`] when nothing arrives in time and with
    /// [`EngineError::QueueClosed`] once the queue is closed and drained.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Job> {
        let deadline = deadline_after(timeout);

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so an enqueue between the check and the await is not lost
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(job) = state.pop_first() {
                    return Ok(job);
                }
                if state.closed {
                    return Err(EngineError::QueueClosed);
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(EngineError::DequeueTimeout(timeout));
            }
        }
    }

    /// Remove a job that has not been dequeued yet
    pub fn remove(&self, job_id: JobId) -> Option<Job> {
        let mut state = self.state.lock();
        let key = state.index.remove(&job_id)?;
        state.entries.remove(&key)
    }

    /// Remove every queued job of a batch, in queue order
    pub fn remove_batch(&self, batch_id: BatchId) -> Vec<Job> {
        let mut state = self.state.lock();
        let keys: Vec<QueueKey> = state
            .entries
            .iter()
            .filter(|(_, job)| job.batch_id == batch_id)
            .map(|(key, _)| *key)
            .collect();

        let mut removed = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(job) = state.entries.remove(&key) {
                state.index.remove(&job.id);
                removed.push(job);
            }
        }
        if !removed.is_empty() {
            debug!(batch_id = %batch_id, removed = removed.len(), "Removed queued jobs for batch");
        }
        removed
    }

    /// Refuse new jobs, wake every waiting worker and hand back whatever was still queued
    pub fn close(&self) -> Vec<Job> {
        let drained: Vec<Job> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.index.clear();
            std::mem::take(&mut state.entries).into_values().collect()
        };
        self.available.notify_waiters();
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued job count for one batch
    pub fn len_for_batch(&self, batch_id: BatchId) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|job| job.batch_id == batch_id)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::JobKind;
    use std::collections::HashSet;
    use std::sync::Arc;

    fn job(batch_id: BatchId, index: usize, priority: Priority) -> Job {
        Job::new(
            batch_id,
            index,
            format!("apn-{index}"),
            JobKind::BasicSearch,
            priority,
        )
    }

    #[test]
    fn test_priority_then_fifo_order() {
        let queue = JobQueue::new();
        let batch = BatchId::new();
        queue.enqueue(job(batch, 0, Priority::Low)).unwrap();
        queue.enqueue(job(batch, 1, Priority::High)).unwrap();
        queue.enqueue(job(batch, 2, Priority::Normal)).unwrap();
        queue.enqueue(job(batch, 3, Priority::High)).unwrap();
        queue.enqueue(job(batch, 4, Priority::Critical)).unwrap();

        let order: Vec<usize> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|job| job.index)
            .collect();
        assert_eq!(order, vec![4, 1, 3, 2, 0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove_and_remove_batch() {
        let queue = JobQueue::new();
        let batch_a = BatchId::new();
        let batch_b = BatchId::new();
        let first = job(batch_a, 0, Priority::Normal);
        let first_id = first.id;
        queue.enqueue(first).unwrap();
        queue.enqueue(job(batch_b, 1, Priority::Normal)).unwrap();
        queue.enqueue(job(batch_a, 2, Priority::Normal)).unwrap();

        assert_eq!(queue.remove(first_id).map(|job| job.index), Some(0));
        assert!(queue.remove(first_id).is_none());

        let removed = queue.remove_batch(batch_a);
        assert_eq!(removed.len(), 1);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.len_for_batch(batch_b), 1);
        assert_eq!(queue.try_dequeue().map(|job| job.batch_id), Some(batch_b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dequeue_times_out_when_empty() {
        let queue = JobQueue::new();
        let result = queue.dequeue(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(EngineError::DequeueTimeout(_))));
    }

    #[tokio::test]
    async fn test_unbounded_timeout_waits_instead_of_overflowing() {
        let queue = Arc::new(JobQueue::new());
        queue.enqueue(job(BatchId::new(), 1, Priority::Normal)).unwrap();
        assert_eq!(queue.dequeue(Duration::MAX).await.unwrap().index, 1);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::MAX).await })
        };
        tokio::task::yield_now().await;
        queue.enqueue(job(BatchId::new(), 2, Priority::Normal)).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().index, 2);
    }

    #[tokio::test]
    async fn test_blocked_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        queue.enqueue(job(BatchId::new(), 7, Priority::Low)).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().index, 7);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_drains() {
        let queue = Arc::new(JobQueue::new());
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;

        let drained = queue.close();
        assert!(drained.is_empty());
        assert!(matches!(waiter.await.unwrap(), Err(EngineError::QueueClosed)));
        assert!(matches!(
            queue.enqueue(job(BatchId::new(), 0, Priority::Normal)),
            Err(EngineError::QueueClosed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dequeue_delivers_each_job_once() {
        let queue = Arc::new(JobQueue::new());
        let batch = BatchId::new();
        let jobs: Vec<Job> = (0..200).map(|i| job(batch, i, Priority::Normal)).collect();
        queue.enqueue_all(jobs).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let queue = Arc::clone(&queue);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Ok(job) = queue.dequeue(Duration::from_millis(20)).await {
                    seen.push(job.id);
                }
                seen
            }));
        }

        let mut all = HashSet::new();
        let mut count = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                all.insert(id);
                count += 1;
            }
        }
        assert_eq!(count, 200);
        assert_eq!(all.len(), 200);
    }
}
