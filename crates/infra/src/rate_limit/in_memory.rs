//! In-memory counter store for tests and local development.
//!
//! Key expiry is not modelled; the limiter's `reset_time` check already
//! governs window turnover, so stale buckets are simply overwritten.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{CounterBucket, CounterError, CounterStore};

#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    buckets: Mutex<HashMap<String, CounterBucket>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn read(&self, key: &str) -> Result<Option<CounterBucket>, CounterError> {
        let buckets = self.buckets.lock().unwrap();
        Ok(buckets.get(key).copied())
    }

    async fn initialize(
        &self,
        key: &str,
        reset_time: i64,
        _expiry: Duration,
    ) -> Result<(), CounterError> {
        let mut buckets = self.buckets.lock().unwrap();
        buckets
            .entry(key.to_string())
            .or_insert(CounterBucket { count: 0, reset_time });
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64, CounterError> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets
            .entry(key.to_string())
            .or_insert(CounterBucket { count: 0, reset_time: 0 });
        bucket.count += 1;
        Ok(bucket.count)
    }

    async fn remove(&self, key: &str) -> Result<(), CounterError> {
        let mut buckets = self.buckets.lock().unwrap();
        buckets.remove(key);
        Ok(())
    }
}

/// Store whose every operation fails, for exercising the fail-open path.
#[cfg(test)]
pub struct FailingCounterStore;

#[cfg(test)]
#[async_trait]
impl CounterStore for FailingCounterStore {
    async fn read(&self, _key: &str) -> Result<Option<CounterBucket>, CounterError> {
        Err(CounterError::Unavailable("connection refused".into()))
    }

    async fn initialize(
        &self,
        _key: &str,
        _reset_time: i64,
        _expiry: Duration,
    ) -> Result<(), CounterError> {
        Err(CounterError::Unavailable("connection refused".into()))
    }

    async fn increment(&self, _key: &str) -> Result<i64, CounterError> {
        Err(CounterError::Unavailable("connection refused".into()))
    }

    async fn remove(&self, _key: &str) -> Result<(), CounterError> {
        Err(CounterError::Unavailable("connection refused".into()))
    }
}
