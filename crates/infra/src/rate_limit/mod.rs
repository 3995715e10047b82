//! Per-client fixed-window token bucket over a shared counter store.
//!
//! The bucket for a client is `(count, reset_time)`. A request admits if
//! the atomically incremented count stays at or under the limit; when the
//! window has elapsed the bucket is re-initialized. Admission is decided
//! on the post-increment value, so concurrent requests across all service
//! instances can never admit more than `limit` per window.
//!
//! The limiter fails open: if the counter store is unreachable the
//! request is allowed and the failure logged. Availability is preferred
//! over strict enforcement.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use jobflow_core::ClientId;

mod in_memory;
mod redis;

pub use in_memory::InMemoryCounterStore;
pub use redis::RedisCounterStore;

/// Default requests admitted per window.
pub const DEFAULT_MAX_REQUESTS: i64 = 100;
/// Default window length in seconds.
pub const DEFAULT_WINDOW_SECS: i64 = 60;

/// Extra key lifetime past the window end, so a bucket outlives its own
/// reset check instead of vanishing mid-window under clock skew.
const EXPIRY_SLACK_SECS: u64 = 10;

/// Counter-store error. Always handled by failing open.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),

    #[error("counter command failed: {0}")]
    Command(String),
}

/// A client's bucket as stored: request count and epoch-seconds reset time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterBucket {
    pub count: i64,
    pub reset_time: i64,
}

/// The atomic primitives the limiter needs from the shared store.
///
/// `increment` must be a single-round-trip atomic operation; the limiter
/// never does read-then-write on the count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<CounterBucket>, CounterError>;

    /// Create the bucket fields if absent (set-if-not-exists per field)
    /// and arm the key expiry. Safe to race: at most one writer wins each
    /// field.
    async fn initialize(
        &self,
        key: &str,
        reset_time: i64,
        expiry: Duration,
    ) -> Result<(), CounterError>;

    /// Atomically increment the count, returning the new value.
    async fn increment(&self, key: &str) -> Result<i64, CounterError>;

    async fn remove(&self, key: &str) -> Result<(), CounterError>;
}

#[async_trait]
impl<S: CounterStore + ?Sized> CounterStore for Arc<S> {
    async fn read(&self, key: &str) -> Result<Option<CounterBucket>, CounterError> {
        (**self).read(key).await
    }

    async fn initialize(
        &self,
        key: &str,
        reset_time: i64,
        expiry: Duration,
    ) -> Result<(), CounterError> {
        (**self).initialize(key, reset_time, expiry).await
    }

    async fn increment(&self, key: &str) -> Result<i64, CounterError> {
        (**self).increment(key).await
    }

    async fn remove(&self, key: &str) -> Result<(), CounterError> {
        (**self).remove(key).await
    }
}

/// Limiter over a type-erased store, for callers that pick the backend
/// at runtime.
pub type SharedRateLimiter = RateLimiter<Arc<dyn CounterStore>>;

/// Outcome of a rate-limit check, carrying the values the boundary layer
/// surfaces as `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    pub reset_after_secs: i64,
}

impl RateLimitDecision {
    fn open(limit: i64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_after_secs: 0,
        }
    }
}

/// Shared, per-client token bucket limiter.
pub struct RateLimiter<S> {
    store: S,
    enabled: bool,
    max_requests: i64,
    window_secs: i64,
}

impl<S: CounterStore> RateLimiter<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            enabled: true,
            max_requests: DEFAULT_MAX_REQUESTS,
            window_secs: DEFAULT_WINDOW_SECS,
        }
    }

    pub fn with_limit(mut self, max_requests: i64, window_secs: i64) -> Self {
        self.max_requests = max_requests.max(1);
        self.window_secs = window_secs.max(1);
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    fn key(client_id: &ClientId) -> String {
        format!("jobflow:rate:{}", client_id)
    }

    /// Check and consume one token for the client.
    pub async fn check(&self, client_id: &ClientId) -> RateLimitDecision {
        self.check_at(client_id, Utc::now().timestamp()).await
    }

    /// Check at an explicit clock reading. Exposed for deterministic tests.
    pub async fn check_at(&self, client_id: &ClientId, now: i64) -> RateLimitDecision {
        if !self.enabled {
            return RateLimitDecision::open(self.max_requests);
        }

        let key = Self::key(client_id);

        let bucket = match self.store.read(&key).await {
            Ok(bucket) => bucket,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "rate-limit store unreachable, failing open");
                return RateLimitDecision::open(self.max_requests);
            }
        };

        let reset_time = match bucket {
            Some(b) if now < b.reset_time => b.reset_time,
            stale => {
                // Absent or expired window: start a fresh bucket.
                let reset_time = now + self.window_secs;
                if stale.is_some() {
                    if let Err(e) = self.store.remove(&key).await {
                        warn!(client_id = %client_id, error = %e, "rate-limit reset failed, failing open");
                        return RateLimitDecision::open(self.max_requests);
                    }
                }
                let expiry =
                    Duration::from_secs(self.window_secs as u64 + EXPIRY_SLACK_SECS);
                if let Err(e) = self.store.initialize(&key, reset_time, expiry).await {
                    warn!(client_id = %client_id, error = %e, "rate-limit init failed, failing open");
                    return RateLimitDecision::open(self.max_requests);
                }
                reset_time
            }
        };

        let count = match self.store.increment(&key).await {
            Ok(count) => count,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "rate-limit increment failed, failing open");
                return RateLimitDecision::open(self.max_requests);
            }
        };

        let allowed = count <= self.max_requests;
        let decision = RateLimitDecision {
            allowed,
            limit: self.max_requests,
            remaining: (self.max_requests - count).max(0),
            reset_after_secs: (reset_time - now).max(0),
        };

        if allowed {
            debug!(client_id = %client_id, count, limit = self.max_requests, "request admitted");
        } else {
            warn!(
                client_id = %client_id,
                count,
                limit = self.max_requests,
                reset_after_secs = decision.reset_after_secs,
                "rate limit exceeded"
            );
        }

        decision
    }

    /// Remaining requests in the client's current window.
    pub async fn remaining(&self, client_id: &ClientId) -> i64 {
        self.remaining_at(client_id, Utc::now().timestamp()).await
    }

    pub async fn remaining_at(&self, client_id: &ClientId, now: i64) -> i64 {
        if !self.enabled {
            return self.max_requests;
        }
        match self.store.read(&Self::key(client_id)).await {
            Ok(Some(b)) if now < b.reset_time => (self.max_requests - b.count).max(0),
            Ok(_) => self.max_requests,
            Err(e) => {
                warn!(client_id = %client_id, error = %e, "rate-limit read failed");
                self.max_requests
            }
        }
    }

    /// Seconds until the client's window resets; 0 when no active bucket.
    pub async fn seconds_until_reset(&self, client_id: &ClientId) -> i64 {
        let now = Utc::now().timestamp();
        match self.store.read(&Self::key(client_id)).await {
            Ok(Some(b)) if now < b.reset_time => b.reset_time - now,
            _ => 0,
        }
    }

    /// Administrative override: drop the client's bucket entirely.
    pub async fn reset(&self, client_id: &ClientId) -> Result<(), CounterError> {
        self.store.remove(&Self::key(client_id)).await?;
        debug!(client_id = %client_id, "rate limit reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: i64, window: i64) -> RateLimiter<InMemoryCounterStore> {
        RateLimiter::new(InMemoryCounterStore::new()).with_limit(max, window)
    }

    #[tokio::test]
    async fn admits_up_to_limit_then_rejects() {
        let limiter = limiter(100, 60);
        let client = ClientId::from("burst-bot");
        let now = 1_000_000;

        for i in 1..=100 {
            let d = limiter.check_at(&client, now).await;
            assert!(d.allowed, "request {} should be admitted", i);
            assert_eq!(d.remaining, 100 - i);
        }

        let d = limiter.check_at(&client, now).await;
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.reset_after_secs, 60);
    }

    #[tokio::test]
    async fn window_elapse_resets_the_bucket() {
        let limiter = limiter(2, 60);
        let client = ClientId::from("c1");
        let now = 1_000_000;

        assert!(limiter.check_at(&client, now).await.allowed);
        assert!(limiter.check_at(&client, now).await.allowed);
        assert!(!limiter.check_at(&client, now).await.allowed);

        let later = now + 61;
        let d = limiter.check_at(&client, later).await;
        assert!(d.allowed);
        assert_eq!(d.remaining, 1);
    }

    #[tokio::test]
    async fn concurrent_checks_never_exceed_limit() {
        let limiter = std::sync::Arc::new(limiter(50, 60));
        let client = ClientId::from("swarm");
        let now = 1_000_000;

        let mut tasks = Vec::new();
        for _ in 0..200 {
            let limiter = limiter.clone();
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                limiter.check_at(&client, now).await.allowed
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert!(admitted <= 50, "admitted {} of limit 50", admitted);
    }

    #[tokio::test]
    async fn clients_have_independent_buckets() {
        let limiter = limiter(1, 60);
        let now = 1_000_000;

        assert!(limiter.check_at(&ClientId::from("a"), now).await.allowed);
        assert!(!limiter.check_at(&ClientId::from("a"), now).await.allowed);
        assert!(limiter.check_at(&ClientId::from("b"), now).await.allowed);
    }

    #[tokio::test]
    async fn disabled_limiter_always_allows() {
        let limiter = limiter(1, 60).with_enabled(false);
        let client = ClientId::from("c1");
        for _ in 0..10 {
            assert!(limiter.check_at(&client, 0).await.allowed);
        }
    }

    #[tokio::test]
    async fn admin_reset_reopens_the_window() {
        let limiter = limiter(1, 60);
        let client = ClientId::from("c1");
        let now = 1_000_000;

        assert!(limiter.check_at(&client, now).await.allowed);
        assert!(!limiter.check_at(&client, now).await.allowed);

        limiter.reset(&client).await.unwrap();
        assert!(limiter.check_at(&client, now).await.allowed);
    }

    #[tokio::test]
    async fn unreachable_store_fails_open() {
        let limiter = RateLimiter::new(in_memory::FailingCounterStore).with_limit(1, 60);
        let client = ClientId::from("c1");
        for _ in 0..5 {
            assert!(limiter.check_at(&client, 0).await.allowed);
        }
    }
}
