//! Fixed-delay dispatch loop.
//!
//! Every poll interval the scheduler loads due PENDING jobs, publishes
//! each to the delivery channel, and only then flips the row to RUNNING.
//! Publish-then-persist means a crash between the two steps can publish
//! the same job twice; the worker tolerates duplicates, so the scheduler
//! never needs a transactional outbox.
//!
//! A failed publish leaves the job PENDING for the next tick. One bad
//! job never stops the rest of the batch.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use jobflow_core::JobStatus;

use crate::queue::JobQueueProducer;
use crate::store::{JobStore, StoreError};

/// Default delay between the end of one tick and the start of the next.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval between statistics log lines.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    /// Jobs published and marked RUNNING.
    pub dispatched: usize,
    /// Jobs left PENDING because publish or persist failed.
    pub deferred: usize,
}

pub struct Scheduler {
    store: Arc<dyn JobStore>,
    producer: Box<dyn JobQueueProducer>,
    poll_interval: Duration,
    stats_interval: Duration,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>, producer: Box<dyn JobQueueProducer>) -> Self {
        Self {
            store,
            producer,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stats_interval: DEFAULT_STATS_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_stats_interval(mut self, stats_interval: Duration) -> Self {
        self.stats_interval = stats_interval;
        self
    }

    /// One dispatch pass over the due jobs.
    #[instrument(skip(self), err)]
    pub async fn tick(&self) -> Result<TickOutcome, SchedulerError> {
        let now = Utc::now();
        let due = self.store.find_ready(JobStatus::Pending, now).await?;
        if due.is_empty() {
            return Ok(TickOutcome::default());
        }

        debug!(count = due.len(), "dispatching due jobs");
        let mut outcome = TickOutcome::default();

        for mut job in due {
            match self.producer.publish(&job.client_id, job.id).await {
                Ok(partition) => {
                    job.mark_running();
                    if let Err(e) = self.store.save(&job).await {
                        // Already published: the worker may run it while
                        // the row still says PENDING. At-least-once
                        // covers this; the next tick republishes.
                        warn!(job_id = %job.id, error = %e, "published but failed to persist RUNNING");
                        outcome.deferred += 1;
                        continue;
                    }
                    debug!(job_id = %job.id, partition, "job dispatched");
                    outcome.dispatched += 1;
                }
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "publish failed, job stays pending");
                    outcome.deferred += 1;
                }
            }
        }

        info!(
            dispatched = outcome.dispatched,
            deferred = outcome.deferred,
            "scheduler tick complete"
        );
        Ok(outcome)
    }

    /// Log a per-status census of the job table.
    pub async fn log_statistics(&self) {
        let mut counts = Vec::with_capacity(JobStatus::ALL.len());
        for status in JobStatus::ALL {
            match self.store.count_by_status(status).await {
                Ok(count) => counts.push((status, count)),
                Err(e) => {
                    warn!(status = %status, error = %e, "failed to count jobs");
                    return;
                }
            }
        }

        info!(
            pending = counts[0].1,
            running = counts[1].1,
            completed = counts[2].1,
            failed = counts[3].1,
            dead_letter = counts[4].1,
            "job statistics"
        );
    }

    /// Run the fixed-delay loop until the shutdown signal flips.
    ///
    /// Fixed delay, not fixed rate: the interval starts counting after a
    /// tick finishes, so a slow tick never causes overlapping passes.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                poll_interval_ms = self.poll_interval.as_millis() as u64,
                "scheduler started"
            );
            let mut last_stats = tokio::time::Instant::now();

            loop {
                if let Err(e) = self.tick().await {
                    error!(error = %e, "scheduler tick failed");
                }

                if last_stats.elapsed() >= self.stats_interval {
                    self.log_statistics().await;
                    last_stats = tokio::time::Instant::now();
                }

                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("scheduler stopping");
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use jobflow_core::{ClientId, Job, JobKind};

    use crate::queue::{InMemoryJobQueue, JobQueue};
    use crate::store::InMemoryJobStore;

    fn due_job(client: &str) -> Job {
        let mut job = Job::new(ClientId::from(client), JobKind::PaymentProcess, "{}");
        job.scheduled_at = Utc::now() - ChronoDuration::seconds(1);
        job
    }

    #[tokio::test]
    async fn tick_publishes_due_jobs_and_marks_them_running() {
        let store = InMemoryJobStore::arc();
        let queue = InMemoryJobQueue::new(4);
        let scheduler = Scheduler::new(store.clone(), queue.producer());

        let job = due_job("c1");
        store.save(&job).await.unwrap();

        let outcome = scheduler.tick().await.unwrap();
        assert_eq!(outcome.dispatched, 1);
        assert_eq!(outcome.deferred, 0);

        let saved = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn tick_skips_future_jobs() {
        let store = InMemoryJobStore::arc();
        let queue = InMemoryJobQueue::new(4);
        let scheduler = Scheduler::new(store.clone(), queue.producer());

        let mut job = Job::new(ClientId::from("c1"), JobKind::PaymentProcess, "{}");
        job.scheduled_at = Utc::now() + ChronoDuration::minutes(5);
        store.save(&job).await.unwrap();

        let outcome = scheduler.tick().await.unwrap();
        assert_eq!(outcome.dispatched, 0);

        let saved = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn dispatched_jobs_are_not_picked_up_again() {
        let store = InMemoryJobStore::arc();
        let queue = InMemoryJobQueue::new(4);
        let scheduler = Scheduler::new(store.clone(), queue.producer());

        let job = due_job("c1");
        store.save(&job).await.unwrap();

        assert_eq!(scheduler.tick().await.unwrap().dispatched, 1);
        assert_eq!(scheduler.tick().await.unwrap().dispatched, 0);
    }

    #[tokio::test]
    async fn persist_failure_after_publish_defers_until_the_next_tick() {
        use std::sync::atomic::{AtomicBool, Ordering};

        use chrono::{DateTime, Utc};
        use jobflow_core::JobId;

        struct FailFirstSave {
            inner: Arc<InMemoryJobStore>,
            failed: AtomicBool,
        }

        #[async_trait::async_trait]
        impl JobStore for FailFirstSave {
            async fn save(&self, job: &Job) -> Result<(), StoreError> {
                if !self.failed.swap(true, Ordering::SeqCst) {
                    return Err(StoreError::Database("connection reset".into()));
                }
                self.inner.save(job).await
            }

            async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
                self.inner.find_by_id(id).await
            }

            async fn find_ready(
                &self,
                status: JobStatus,
                before: DateTime<Utc>,
            ) -> Result<Vec<Job>, StoreError> {
                self.inner.find_ready(status, before).await
            }

            async fn find_by_client(&self, client_id: &ClientId) -> Result<Vec<Job>, StoreError> {
                self.inner.find_by_client(client_id).await
            }

            async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
                self.inner.find_by_status(status).await
            }

            async fn count_by_status(&self, status: JobStatus) -> Result<i64, StoreError> {
                self.inner.count_by_status(status).await
            }

            async fn find_stuck(
                &self,
                status: JobStatus,
                updated_before: DateTime<Utc>,
            ) -> Result<Vec<Job>, StoreError> {
                self.inner.find_stuck(status, updated_before).await
            }
        }

        let inner = InMemoryJobStore::arc();
        let job = due_job("c1");
        inner.save(&job).await.unwrap();

        let store = Arc::new(FailFirstSave {
            inner: inner.clone(),
            failed: AtomicBool::new(false),
        });
        let queue = InMemoryJobQueue::new(4);
        let scheduler = Scheduler::new(store, queue.producer());

        // Publish succeeds, persisting RUNNING does not: the job counts
        // as deferred and the row stays PENDING.
        let outcome = scheduler.tick().await.unwrap();
        assert_eq!(outcome.dispatched, 0);
        assert_eq!(outcome.deferred, 1);
        let saved = inner.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Pending);

        // Next tick republishes; the worker side tolerates the duplicate.
        let retried = scheduler.tick().await.unwrap();
        assert_eq!(retried.dispatched, 1);
        let saved = inner.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(saved.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn publish_failure_leaves_the_rest_of_the_batch_intact() {
        struct FailFirst {
            inner: Box<dyn JobQueueProducer>,
            failed: std::sync::atomic::AtomicBool,
        }

        #[async_trait::async_trait]
        impl JobQueueProducer for FailFirst {
            async fn publish(
                &self,
                client_id: &ClientId,
                job_id: jobflow_core::JobId,
            ) -> Result<u32, crate::queue::QueueError> {
                if !self.failed.swap(true, std::sync::atomic::Ordering::SeqCst) {
                    return Err(crate::queue::QueueError::Connection("down".into()));
                }
                self.inner.publish(client_id, job_id).await
            }
        }

        let store = InMemoryJobStore::arc();
        let queue = InMemoryJobQueue::new(4);
        let producer = Box::new(FailFirst {
            inner: queue.producer(),
            failed: std::sync::atomic::AtomicBool::new(false),
        });
        let scheduler = Scheduler::new(store.clone(), producer);

        let first = due_job("a");
        let second = due_job("b");
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        let outcome = scheduler.tick().await.unwrap();
        assert_eq!(outcome.dispatched + outcome.deferred, 2);
        assert_eq!(outcome.deferred, 1);

        // The deferred job is still pending and goes out next tick.
        let retried = scheduler.tick().await.unwrap();
        assert_eq!(retried.dispatched, 1);
    }
}
