//! Infrastructure layer: job store, cache, rate limiting, delivery
//! channel, scheduler, worker pool, and the job service facade.

pub mod cache;
pub mod config;
pub mod handlers;
pub mod queue;
pub mod rate_limit;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod worker;

pub use cache::{InMemoryJobCache, JobCache, RedisJobCache};
pub use config::AppConfig;
pub use handlers::{HandlerError, HandlerRegistry, JobHandler};
pub use queue::{InMemoryJobQueue, JobQueue, QueueMessage, RedisJobQueue};
pub use rate_limit::{RateLimitDecision, RateLimiter, SharedRateLimiter};
pub use scheduler::Scheduler;
pub use service::{JobService, ServiceError};
pub use store::{InMemoryJobStore, JobStore, PostgresJobStore, StoreError};
pub use worker::{Worker, WorkerPool, WorkerPoolHandle};
