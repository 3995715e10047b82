//! Job processor daemon: store + cache + queue + scheduler + workers,
//! plus the rate-limited service surface an embedding API layer calls.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use jobflow_infra::cache::RedisJobCache;
use jobflow_infra::handlers::HandlerRegistry;
use jobflow_infra::queue::{JobQueue, RedisJobQueue};
use jobflow_infra::rate_limit::{CounterStore, RateLimiter, RedisCounterStore};
use jobflow_infra::scheduler::Scheduler;
use jobflow_infra::service::{JobService, DEFAULT_STUCK_THRESHOLD_MINUTES};
use jobflow_infra::store::{JobStore, PostgresJobStore};
use jobflow_infra::worker::WorkerPool;
use jobflow_infra::AppConfig;

/// How often the daemon scans for jobs stuck in RUNNING.
const STUCK_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobflow_observability::init();

    let config = AppConfig::from_env();
    tracing::info!(
        partitions = config.queue_partitions,
        workers = config.worker_concurrency,
        poll_interval_ms = config.scheduler_poll_interval.as_millis() as u64,
        rate_limit_enabled = config.rate_limit_enabled,
        rate_limit = config.rate_limit_max_requests,
        rate_limit_window_secs = config.rate_limit_window_secs,
        "starting jobflow"
    );

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("connecting to postgres")?;
    let store = PostgresJobStore::new(pool);
    store.migrate().await.context("running migrations")?;
    let store: Arc<dyn JobStore> = Arc::new(store);

    let redis_client =
        redis::Client::open(config.redis_url.as_str()).context("parsing redis url")?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("connecting to redis")?;
    let cache = Arc::new(RedisJobCache::new(redis_conn.clone()).with_ttl(config.cache_ttl));

    let queue = RedisJobQueue::connect(&config.redis_url, config.queue_partitions)
        .await
        .context("setting up job queue")?;

    let counters: Arc<dyn CounterStore> = Arc::new(RedisCounterStore::new(redis_conn));
    let limiter = RateLimiter::new(counters)
        .with_limit(config.rate_limit_max_requests, config.rate_limit_window_secs)
        .with_enabled(config.rate_limit_enabled);
    let service = Arc::new(
        JobService::new(store.clone(), cache.clone()).with_rate_limiter(limiter),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor_task = spawn_stuck_job_monitor(service, shutdown_rx.clone());

    let scheduler = Scheduler::new(store.clone(), queue.producer())
        .with_poll_interval(config.scheduler_poll_interval);
    let scheduler_task = scheduler.spawn(shutdown_rx);

    let registry = Arc::new(HandlerRegistry::with_builtin_handlers());
    let pool_handle = WorkerPool::new(store, cache, registry)
        .with_concurrency(config.worker_concurrency)
        .spawn(&queue)
        .await
        .context("starting worker pool")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = scheduler_task.await;
    let _ = monitor_task.await;
    pool_handle.shutdown().await;

    tracing::info!("jobflow stopped");
    Ok(())
}

/// Periodically surface RUNNING jobs nobody has touched, usually
/// casualties of a worker crash.
fn spawn_stuck_job_monitor(
    service: Arc<JobService>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(STUCK_CHECK_INTERVAL) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
            }

            match service
                .find_stuck_jobs(DEFAULT_STUCK_THRESHOLD_MINUTES)
                .await
            {
                Ok(stuck) => {
                    for job in stuck {
                        tracing::warn!(
                            job_id = %job.id,
                            client_id = %job.client_id,
                            updated_at = %job.updated_at,
                            "job stuck in RUNNING"
                        );
                    }
                }
                Err(e) => tracing::warn!(error = %e, "stuck-job check failed"),
            }
        }
    })
}
