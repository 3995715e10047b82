//! Cache-aside read acceleration for job details.
//!
//! The cache is never authoritative: a miss (or any cache failure) sends
//! the caller to the job store. The surface is deliberately infallible —
//! implementations log their errors and degrade to miss/no-op, so cache
//! unavailability never fails a request.

use std::time::Duration;

use async_trait::async_trait;

use jobflow_core::{Job, JobId};

mod in_memory;
mod redis;

pub use in_memory::InMemoryJobCache;
pub use redis::RedisJobCache;

/// Default time-to-live for cached job entries.
pub const DEFAULT_JOB_TTL: Duration = Duration::from_secs(15 * 60);

/// Time-bounded projection of job rows.
#[async_trait]
pub trait JobCache: Send + Sync {
    /// Cached snapshot, or `None` on miss or cache failure.
    async fn get(&self, id: JobId) -> Option<Job>;

    /// Store a snapshot with the configured TTL.
    async fn put(&self, job: &Job);

    /// Drop a cached entry.
    async fn invalidate(&self, id: JobId);

    /// Invalidate-then-put, run after every state mutation.
    async fn refresh(&self, job: &Job) {
        self.invalidate(job.id).await;
        self.put(job).await;
    }
}
