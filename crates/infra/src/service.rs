//! Job service: the operation surface callers go through.
//!
//! Thin on purpose. Creation checks the caller's rate limit, persists a
//! PENDING row and returns; the scheduler and workers do everything
//! else. Reads go cache-first for single-job lookups and straight to
//! the store for listings.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, instrument};

use jobflow_core::{ClientId, Job, JobId, JobKind, JobStatus};

use crate::cache::JobCache;
use crate::rate_limit::SharedRateLimiter;
use crate::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("job {0} not found")]
    NotFound(JobId),

    #[error("rate limit exceeded for {client_id}, retry in {retry_after_secs}s")]
    RateLimited {
        client_id: ClientId,
        retry_after_secs: i64,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Default age after which a RUNNING job counts as stuck.
pub const DEFAULT_STUCK_THRESHOLD_MINUTES: i64 = 10;

pub struct JobService {
    store: Arc<dyn JobStore>,
    cache: Arc<dyn JobCache>,
    limiter: Option<SharedRateLimiter>,
}

impl JobService {
    pub fn new(store: Arc<dyn JobStore>, cache: Arc<dyn JobCache>) -> Self {
        Self {
            store,
            cache,
            limiter: None,
        }
    }

    /// Enforce a per-client rate limit on job creation.
    pub fn with_rate_limiter(mut self, limiter: SharedRateLimiter) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Create and persist a new job, scheduled for immediate pickup.
    ///
    /// Consumes one rate-limit token for the client when a limiter is
    /// configured; an over-limit caller gets the retry-after delay.
    #[instrument(skip(self, payload), fields(client_id = %client_id), err)]
    pub async fn create_job(
        &self,
        client_id: ClientId,
        kind: JobKind,
        payload: impl Into<String>,
    ) -> Result<Job, ServiceError> {
        if let Some(limiter) = &self.limiter {
            let decision = limiter.check(&client_id).await;
            if !decision.allowed {
                return Err(ServiceError::RateLimited {
                    client_id,
                    retry_after_secs: decision.reset_after_secs,
                });
            }
        }

        let job = Job::new(client_id, kind, payload);
        self.store.save(&job).await?;
        self.cache.put(&job).await;
        info!(job_id = %job.id, kind = %job.kind, "job created");
        Ok(job)
    }

    /// Single-job lookup, cache first.
    #[instrument(skip(self), err)]
    pub async fn get_job(&self, id: JobId) -> Result<Job, ServiceError> {
        if let Some(job) = self.cache.get(id).await {
            return Ok(job);
        }

        let job = self
            .store
            .find_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound(id))?;
        self.cache.put(&job).await;
        debug!(job_id = %id, "job loaded from store");
        Ok(job)
    }

    pub async fn get_jobs_by_client(&self, client_id: &ClientId) -> Result<Vec<Job>, ServiceError> {
        Ok(self.store.find_by_client(client_id).await?)
    }

    pub async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, ServiceError> {
        Ok(self.store.find_by_status(status).await?)
    }

    pub async fn count_jobs_by_status(&self, status: JobStatus) -> Result<i64, ServiceError> {
        Ok(self.store.count_by_status(status).await?)
    }

    /// Census across every status, for dashboards and the stats log.
    pub async fn status_counts(&self) -> Result<HashMap<JobStatus, i64>, ServiceError> {
        let mut counts = HashMap::with_capacity(JobStatus::ALL.len());
        for status in JobStatus::ALL {
            counts.insert(status, self.store.count_by_status(status).await?);
        }
        Ok(counts)
    }

    /// PENDING jobs whose scheduled time has arrived.
    pub async fn find_jobs_ready_for_scheduling(&self) -> Result<Vec<Job>, ServiceError> {
        Ok(self
            .store
            .find_ready(JobStatus::Pending, Utc::now())
            .await?)
    }

    /// RUNNING jobs that have not been touched within the threshold,
    /// usually casualties of a worker crash.
    pub async fn find_stuck_jobs(&self, threshold_minutes: i64) -> Result<Vec<Job>, ServiceError> {
        let cutoff = Utc::now() - Duration::minutes(threshold_minutes.max(1));
        Ok(self.store.find_stuck(JobStatus::Running, cutoff).await?)
    }
}
