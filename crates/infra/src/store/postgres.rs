//! Postgres-backed job store.
//!
//! One `jobs` table (see `migrations/`), indexed on `(status,
//! scheduled_at)` for the scheduler's promotion query and on `client_id`
//! for per-client listings. `save` is an upsert keyed by id; row-level
//! locking in Postgres is the only concurrency control needed, since only
//! one actor owns a `Running` job at a time.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tracing::instrument;
use uuid::Uuid;

use jobflow_core::{ClientId, Job, JobId, JobKind, JobStatus};

use super::{JobStore, StoreError};

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("migration failed: {}", e)))
    }
}

/// Row shape for sqlx decoding; converted into the domain [`Job`].
#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    client_id: String,
    kind: String,
    status: String,
    payload: String,
    attempts: i32,
    max_retries: i32,
    created_at: DateTime<Utc>,
    scheduled_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_str(&row.status)
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(Job {
            id: JobId::from_uuid(row.id),
            client_id: ClientId::from(row.client_id),
            kind: JobKind::from(row.kind),
            status,
            payload: row.payload,
            attempts: row.attempts,
            max_retries: row.max_retries,
            created_at: row.created_at,
            scheduled_at: row.scheduled_at,
            completed_at: row.completed_at,
            error_message: row.error_message,
            updated_at: row.updated_at,
        })
    }
}

const SELECT_COLUMNS: &str = "id, client_id, kind, status, payload, attempts, max_retries, \
     created_at, scheduled_at, completed_at, error_message, updated_at";

fn map_sqlx_error(operation: &str, e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut => {
            StoreError::Pool(format!("{}: {}", operation, e))
        }
        other => StoreError::Database(format!("{}: {}", operation, other)),
    }
}

fn rows_to_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, StoreError> {
    rows.into_iter().map(Job::try_from).collect()
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status), err)]
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, client_id, kind, status, payload, attempts, max_retries,
                              created_at, scheduled_at, completed_at, error_message, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                attempts = EXCLUDED.attempts,
                scheduled_at = EXCLUDED.scheduled_at,
                completed_at = EXCLUDED.completed_at,
                error_message = EXCLUDED.error_message,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.client_id.as_str())
        .bind(job.kind.as_str())
        .bind(job.status.as_str())
        .bind(&job.payload)
        .bind(job.attempts)
        .bind(job.max_retries)
        .bind(job.created_at)
        .bind(job.scheduled_at)
        .bind(job.completed_at)
        .bind(&job.error_message)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("save", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row: Option<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs WHERE id = $1",
            SELECT_COLUMNS
        ))
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_id", e))?;

        row.map(Job::try_from).transpose()
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn find_ready(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs WHERE status = $1 AND scheduled_at <= $2 \
             ORDER BY scheduled_at ASC",
            SELECT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_ready", e))?;

        rows_to_jobs(rows)
    }

    #[instrument(skip(self), fields(client_id = %client_id), err)]
    async fn find_by_client(&self, client_id: &ClientId) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs WHERE client_id = $1 ORDER BY created_at ASC",
            SELECT_COLUMNS
        ))
        .bind(client_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_client", e))?;

        rows_to_jobs(rows)
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs WHERE status = $1 ORDER BY created_at ASC",
            SELECT_COLUMNS
        ))
        .bind(status.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_by_status", e))?;

        rows_to_jobs(rows)
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn count_by_status(&self, status: JobStatus) -> Result<i64, StoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = $1")
            .bind(status.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_by_status", e))?;

        Ok(count.0)
    }

    #[instrument(skip(self), fields(status = %status), err)]
    async fn find_stuck(
        &self,
        status: JobStatus,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM jobs WHERE status = $1 AND updated_at < $2 \
             ORDER BY updated_at ASC",
            SELECT_COLUMNS
        ))
        .bind(status.as_str())
        .bind(updated_before)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stuck", e))?;

        rows_to_jobs(rows)
    }
}
