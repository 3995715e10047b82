//! In-memory job cache for tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use jobflow_core::{Job, JobId};

use super::{JobCache, DEFAULT_JOB_TTL};

pub struct InMemoryJobCache {
    entries: Mutex<HashMap<JobId, (Job, Instant)>>,
    ttl: Duration,
}

impl Default for InMemoryJobCache {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryJobCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: DEFAULT_JOB_TTL,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl JobCache for InMemoryJobCache {
    async fn get(&self, id: JobId) -> Option<Job> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&id) {
            Some((_, expires_at)) if *expires_at <= Instant::now() => {
                entries.remove(&id);
                None
            }
            Some((job, _)) => Some(job.clone()),
            None => None,
        }
    }

    async fn put(&self, job: &Job) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(job.id, (job.clone(), Instant::now() + self.ttl));
    }

    async fn invalidate(&self, id: JobId) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::{ClientId, JobKind, JobStatus};

    fn test_job() -> Job {
        Job::new(ClientId::from("c1"), JobKind::PaymentProcess, "p")
    }

    #[tokio::test]
    async fn miss_then_hit_then_invalidate() {
        let cache = InMemoryJobCache::new();
        let job = test_job();

        assert!(cache.get(job.id).await.is_none());

        cache.put(&job).await;
        assert_eq!(cache.get(job.id).await.unwrap().id, job.id);

        cache.invalidate(job.id).await;
        assert!(cache.get(job.id).await.is_none());
    }

    #[tokio::test]
    async fn refresh_reflects_latest_state() {
        let cache = InMemoryJobCache::new();
        let mut job = test_job();
        cache.put(&job).await;

        job.mark_running();
        job.mark_completed();
        cache.refresh(&job).await;

        let cached = cache.get(job.id).await.unwrap();
        assert_eq!(cached.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = InMemoryJobCache::new().with_ttl(Duration::from_millis(0));
        let job = test_job();
        cache.put(&job).await;
        assert!(cache.get(job.id).await.is_none());
    }
}
