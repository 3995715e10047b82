//! Redis-backed counter store.
//!
//! Each client's bucket is a hash at `jobflow:rate:{client}` with `count`
//! and `reset_time` fields. `HINCRBY` gives the atomic increment the
//! limiter decides on; initialization uses `HSETNX` so racing workers
//! cannot clobber an in-flight window.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{CounterBucket, CounterError, CounterStore};

const COUNT_FIELD: &str = "count";
const RESET_FIELD: &str = "reset_time";

#[derive(Clone)]
pub struct RedisCounterStore {
    conn: ConnectionManager,
}

impl RedisCounterStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

fn map_redis_error(e: redis::RedisError) -> CounterError {
    if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        CounterError::Unavailable(e.to_string())
    } else {
        CounterError::Command(e.to_string())
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn read(&self, key: &str) -> Result<Option<CounterBucket>, CounterError> {
        let mut conn = self.conn.clone();
        let (count, reset_time): (Option<i64>, Option<i64>) = redis::cmd("HMGET")
            .arg(key)
            .arg(COUNT_FIELD)
            .arg(RESET_FIELD)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        match (count, reset_time) {
            (Some(count), Some(reset_time)) => Ok(Some(CounterBucket { count, reset_time })),
            _ => Ok(None),
        }
    }

    async fn initialize(
        &self,
        key: &str,
        reset_time: i64,
        expiry: Duration,
    ) -> Result<(), CounterError> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .hset_nx(key, COUNT_FIELD, 0)
            .ignore()
            .hset_nx(key, RESET_FIELD, reset_time)
            .ignore()
            .expire(key, expiry.as_secs() as i64)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn increment(&self, key: &str) -> Result<i64, CounterError> {
        let mut conn = self.conn.clone();
        conn.hincr(key, COUNT_FIELD, 1)
            .await
            .map_err(map_redis_error)
    }

    async fn remove(&self, key: &str) -> Result<(), CounterError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(map_redis_error)
    }
}
