//! Job persistence: the durable source of truth for every job.
//!
//! The store must tolerate one scheduler and many workers writing
//! concurrently. Contention is only ever on a single job id, because
//! exactly one actor owns a `Running` job at a time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use jobflow_core::{ClientId, Job, JobId, JobStatus};

mod in_memory;
mod postgres;

pub use in_memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;

/// Store-level error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("failed to decode job row: {0}")]
    Decode(String),

    #[error("connection pool unavailable: {0}")]
    Pool(String),
}

/// Durable CRUD and indexed queries over the [`Job`] entity.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert or update a job (upsert keyed by id).
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Jobs in `status` with `scheduled_at <= before`, ordered by
    /// `scheduled_at` ascending. The scheduler's primary read.
    async fn find_ready(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;

    async fn find_by_client(&self, client_id: &ClientId) -> Result<Vec<Job>, StoreError>;

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, StoreError>;

    /// Jobs in `status` whose `updated_at` is older than `updated_before`.
    /// Used to surface stuck `Running` jobs for operator alerting.
    async fn find_stuck(
        &self,
        status: JobStatus,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError>;
}
