//! Worker pool: the consuming side of the delivery channel.
//!
//! Each worker owns a disjoint set of partitions and drains them
//! serially, which is what upholds per-client ordering. Processing a
//! message means loading the authoritative job row (cache first, store
//! on miss), dispatching to the kind's handler, persisting the outcome,
//! refreshing the cache, and only then committing the offset.
//!
//! Retry never goes through channel redelivery: a failed job is
//! committed like a successful one, and the backoff-stamped PENDING row
//! brings it back through the scheduler. The offset stays uncommitted
//! only when the outcome itself could not be persisted; the worker then
//! rewinds its consumer so the message is fetched again in-process
//! instead of waiting for a restart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use jobflow_core::Job;

use crate::cache::JobCache;
use crate::handlers::HandlerRegistry;
use crate::queue::{assign_partitions, JobQueue, JobQueueConsumer, QueueError, QueueMessage};
use crate::store::JobStore;

/// How long a fetch blocks waiting for a message before the worker
/// re-checks the shutdown signal.
const FETCH_WAIT: Duration = Duration::from_secs(1);

/// How a message left the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Handler succeeded; job is COMPLETED.
    Completed,
    /// Handler failed; job went back to PENDING with backoff.
    Retried,
    /// Handler failed for the last time; job is DEAD_LETTER.
    DeadLettered,
    /// Job row was already terminal (duplicate delivery).
    Skipped,
    /// No job row exists for the message (poison).
    Dropped,
    /// Outcome could not be persisted; offset left uncommitted.
    Deferred,
}

/// Pool-wide counters, shared by all workers.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
    dropped: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
}

impl WorkerCounters {
    pub fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// One consuming worker. The pool spawns several; tests drive one
/// directly through [`Worker::process`].
pub struct Worker {
    name: String,
    store: Arc<dyn JobStore>,
    cache: Arc<dyn JobCache>,
    registry: Arc<HandlerRegistry>,
    counters: Arc<WorkerCounters>,
}

impl Worker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        cache: Arc<dyn JobCache>,
        registry: Arc<HandlerRegistry>,
        counters: Arc<WorkerCounters>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            cache,
            registry,
            counters,
        }
    }

    /// Load the job, cache first. The store is authoritative; a cache
    /// failure is just a miss.
    async fn load_job(&self, message: &QueueMessage) -> Result<Option<Job>, ProcessOutcome> {
        if let Some(job) = self.cache.get(message.job_id).await {
            return Ok(Some(job));
        }
        match self.store.find_by_id(message.job_id).await {
            Ok(found) => Ok(found),
            Err(e) => {
                error!(job_id = %message.job_id, error = %e, "store lookup failed");
                Err(ProcessOutcome::Deferred)
            }
        }
    }

    /// Process one delivered message end to end.
    ///
    /// Every branch except [`ProcessOutcome::Deferred`] must be followed
    /// by an offset commit.
    #[instrument(skip(self, message), fields(worker = %self.name, job_id = %message.job_id, partition = message.partition))]
    pub async fn process(&self, message: &QueueMessage) -> ProcessOutcome {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let mut job = match self.load_job(message).await {
            Err(outcome) => return outcome,
            Ok(None) => {
                // Poison message: nothing durable to retry against.
                warn!("no job row for delivered message, dropping");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                return ProcessOutcome::Dropped;
            }
            Ok(Some(job)) => job,
        };

        if job.is_terminal() {
            // Duplicate delivery of an already-resolved job.
            debug!(status = %job.status, "job already terminal, skipping");
            return ProcessOutcome::Skipped;
        }

        match self.registry.dispatch(&job).await {
            Ok(()) => {
                job.mark_completed();
                if let Err(e) = self.store.save(&job).await {
                    error!(error = %e, "failed to persist completion");
                    return ProcessOutcome::Deferred;
                }
                self.cache.refresh(&job).await;
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(kind = %job.kind, "job completed");
                ProcessOutcome::Completed
            }
            Err(e) => {
                job.record_failure(e.to_string());
                let dead = job.is_terminal();
                if let Err(e) = self.store.save(&job).await {
                    error!(error = %e, "failed to persist failure");
                    return ProcessOutcome::Deferred;
                }
                self.cache.refresh(&job).await;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);

                if dead {
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    error!(
                        attempts = job.attempts,
                        error = %e,
                        "job dead-lettered after exhausting retries"
                    );
                    ProcessOutcome::DeadLettered
                } else {
                    warn!(
                        attempts = job.attempts,
                        retry_at = %job.scheduled_at,
                        error = %e,
                        "job failed, retry scheduled"
                    );
                    ProcessOutcome::Retried
                }
            }
        }
    }

    async fn run(
        self,
        mut consumer: Box<dyn JobQueueConsumer>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(worker = %self.name, "worker started");
        loop {
            let fetched = tokio::select! {
                fetched = consumer.fetch(FETCH_WAIT) => fetched,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            let message = match fetched {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    // Undeliverable fetch (connection or decode). The
                    // entry stays pending and comes back on reconnect.
                    error!(worker = %self.name, error = %e, "fetch failed");
                    tokio::time::sleep(FETCH_WAIT).await;
                    continue;
                }
            };

            let outcome = self.process(&message).await;
            if outcome == ProcessOutcome::Deferred {
                // Leave the offset uncommitted and make it fetchable
                // again once the store has had a moment to recover.
                tokio::time::sleep(FETCH_WAIT).await;
                consumer.rewind().await;
                continue;
            }
            if let Err(e) = consumer.commit(&message).await {
                warn!(
                    worker = %self.name,
                    offset_id = %message.offset_id,
                    error = %e,
                    "commit failed, message may be redelivered"
                );
            }
        }
        info!(worker = %self.name, "worker stopped");
    }
}

pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    cache: Arc<dyn JobCache>,
    registry: Arc<HandlerRegistry>,
    concurrency: usize,
}

/// Running pool. Dropping the handle does not stop the workers; call
/// [`WorkerPoolHandle::shutdown`].
pub struct WorkerPoolHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    counters: Arc<WorkerCounters>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Signal every worker and wait for them to drain.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        cache: Arc<dyn JobCache>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            store,
            cache,
            registry,
            concurrency: 4,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Spawn the workers, each owning its round-robin share of the
    /// queue's partitions.
    pub async fn spawn(self, queue: &dyn JobQueue) -> Result<WorkerPoolHandle, QueueError> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = Arc::new(WorkerCounters::default());
        let assignment = assign_partitions(queue.partition_count(), self.concurrency);

        let mut tasks = Vec::with_capacity(self.concurrency);
        for (i, partitions) in assignment.into_iter().enumerate() {
            let name = format!("worker-{}", i);
            info!(worker = %name, ?partitions, "assigning partitions");
            let consumer = queue.consumer(&name, partitions).await?;
            let worker = Worker::new(
                name,
                self.store.clone(),
                self.cache.clone(),
                self.registry.clone(),
                counters.clone(),
            );
            tasks.push(tokio::spawn(worker.run(consumer, shutdown_rx.clone())));
        }

        Ok(WorkerPoolHandle {
            shutdown_tx,
            tasks,
            counters,
        })
    }
}
