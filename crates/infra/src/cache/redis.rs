//! Redis-backed job cache.
//!
//! Keys `jobflow:job:{id}`, JSON values, per-entry TTL. All failures are
//! logged and swallowed: a broken cache reads as a miss and writes as a
//! no-op, leaving the store as the fallback path.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use jobflow_core::{Job, JobId};

use super::{JobCache, DEFAULT_JOB_TTL};

#[derive(Clone)]
pub struct RedisJobCache {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisJobCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            ttl: DEFAULT_JOB_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn key(id: JobId) -> String {
        format!("jobflow:job:{}", id)
    }
}

#[async_trait]
impl JobCache for RedisJobCache {
    async fn get(&self, id: JobId) -> Option<Job> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.get(Self::key(id)).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(job_id = %id, error = %e, "cache read failed, treating as miss");
                return None;
            }
        };

        let raw = match raw {
            Some(raw) => raw,
            None => {
                debug!(job_id = %id, "cache miss");
                return None;
            }
        };

        match serde_json::from_str::<Job>(&raw) {
            Ok(job) => {
                debug!(job_id = %id, "cache hit");
                Some(job)
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "corrupt cache entry, treating as miss");
                None
            }
        }
    }

    async fn put(&self, job: &Job) {
        let raw = match serde_json::to_string(job) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "failed to serialize job for cache");
                return;
            }
        };

        let mut conn = self.conn.clone();
        if let Err(e) = conn
            .set_ex::<_, _, ()>(Self::key(job.id), raw, self.ttl.as_secs())
            .await
        {
            warn!(job_id = %job.id, error = %e, "cache write failed");
        }
    }

    async fn invalidate(&self, id: JobId) {
        let mut conn = self.conn.clone();
        if let Err(e) = conn.del::<_, ()>(Self::key(id)).await {
            warn!(job_id = %id, error = %e, "cache invalidation failed");
        }
    }
}
