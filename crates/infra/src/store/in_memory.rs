//! In-memory job store for tests and local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use jobflow_core::{ClientId, Job, JobId, JobStatus};

use super::{JobStore, StoreError};

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(&id).cloned())
    }

    async fn find_ready(
        &self,
        status: JobStatus,
        before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == status && j.scheduled_at <= before)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.scheduled_at);
        Ok(result)
    }

    async fn find_by_client(&self, client_id: &ClientId) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| &j.client_id == client_id)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.created_at);
        Ok(result)
    }

    async fn find_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.created_at);
        Ok(result)
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<i64, StoreError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.values().filter(|j| j.status == status).count() as i64)
    }

    async fn find_stuck(
        &self,
        status: JobStatus,
        updated_before: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().await;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == status && j.updated_at < updated_before)
            .cloned()
            .collect();
        result.sort_by_key(|j| j.updated_at);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jobflow_core::JobKind;

    fn job_for(client: &str) -> Job {
        Job::new(ClientId::from(client), JobKind::EmailConfirmation, "p")
    }

    #[tokio::test]
    async fn save_is_an_upsert() {
        let store = InMemoryJobStore::new();
        let mut job = job_for("c1");
        store.save(&job).await.unwrap();

        job.mark_running();
        store.save(&job).await.unwrap();

        let loaded = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn find_ready_orders_by_scheduled_at_and_skips_future() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let mut early = job_for("c1");
        early.scheduled_at = now - Duration::seconds(10);
        let mut late = job_for("c2");
        late.scheduled_at = now - Duration::seconds(1);
        let mut future = job_for("c3");
        future.scheduled_at = now + Duration::seconds(60);

        for j in [&late, &early, &future] {
            store.save(j).await.unwrap();
        }

        let ready = store.find_ready(JobStatus::Pending, now).await.unwrap();
        assert_eq!(ready.len(), 2);
        assert_eq!(ready[0].id, early.id);
        assert_eq!(ready[1].id, late.id);
    }

    #[tokio::test]
    async fn count_and_filter_by_status() {
        let store = InMemoryJobStore::new();
        let mut done = job_for("c1");
        done.mark_running();
        done.mark_completed();
        store.save(&done).await.unwrap();
        store.save(&job_for("c1")).await.unwrap();

        assert_eq!(store.count_by_status(JobStatus::Pending).await.unwrap(), 1);
        assert_eq!(store.count_by_status(JobStatus::Completed).await.unwrap(), 1);
        assert_eq!(store.count_by_status(JobStatus::DeadLetter).await.unwrap(), 0);

        let by_client = store.find_by_client(&ClientId::from("c1")).await.unwrap();
        assert_eq!(by_client.len(), 2);
    }

    #[tokio::test]
    async fn find_stuck_returns_stale_running_jobs() {
        let store = InMemoryJobStore::new();
        let mut stuck = job_for("c1");
        stuck.mark_running();
        stuck.updated_at = Utc::now() - Duration::minutes(30);
        store.save(&stuck).await.unwrap();

        let mut fresh = job_for("c2");
        fresh.mark_running();
        store.save(&fresh).await.unwrap();

        let threshold = Utc::now() - Duration::minutes(10);
        let found = store.find_stuck(JobStatus::Running, threshold).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stuck.id);
    }
}
