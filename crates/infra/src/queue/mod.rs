//! Partitioned, durable delivery channel between scheduler and workers.
//!
//! The channel is a set of numbered partitions. A job is published to the
//! partition derived from its client id, so all of one client's jobs land
//! on the same partition and are consumed in order by whichever worker
//! owns it. Delivery is at-least-once: a message stays pending until the
//! consumer commits it, and an uncommitted message is redelivered to the
//! partition's next consumer.
//!
//! Messages carry only the job id (plus the client id as routing key);
//! workers load the authoritative state from the job store.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use jobflow_core::{ClientId, JobId};

mod in_memory;
mod redis_streams;

pub use in_memory::InMemoryJobQueue;
pub use redis_streams::RedisJobQueue;

/// Default number of partitions.
pub const DEFAULT_PARTITIONS: u32 = 16;

/// Consumer group shared by the worker pool.
pub const CONSUMER_GROUP: &str = "job-workers";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue connection error: {0}")]
    Connection(String),

    #[error("queue command error: {0}")]
    Command(String),

    #[error("malformed queue message: {0}")]
    Decode(String),
}

/// A delivered message awaiting commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub partition: u32,
    pub offset_id: String,
    pub job_id: JobId,
    pub client_id: ClientId,
}

/// Stable routing hash: the same key always maps to the same partition.
///
/// FNV-1a, so the mapping survives process restarts and does not depend
/// on the standard library's hasher seed.
pub fn partition_for(key: &str, partitions: u32) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    (hash % u64::from(partitions.max(1))) as u32
}

/// Producer half of the channel.
#[async_trait]
pub trait JobQueueProducer: Send + Sync {
    /// Append the job to its client's partition; returns the partition.
    async fn publish(&self, client_id: &ClientId, job_id: JobId) -> Result<u32, QueueError>;
}

/// Consumer half of the channel, bound to a set of partitions.
///
/// `fetch` drains this consumer's unacknowledged backlog before reading
/// new messages, so a restarted worker re-sees what it never committed.
#[async_trait]
pub trait JobQueueConsumer: Send {
    async fn fetch(&mut self, max_wait: Duration) -> Result<Option<QueueMessage>, QueueError>;

    /// Mark the message processed. Commit is unconditional on outcome;
    /// retry happens through the store, never through redelivery.
    async fn commit(&mut self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Make this consumer's delivered-but-uncommitted messages eligible
    /// for `fetch` again. Called when a message's outcome could not be
    /// persisted, so the message is retried without waiting for a
    /// process restart.
    async fn rewind(&mut self);
}

/// A partitioned channel that can hand out producers and consumers.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn partition_count(&self) -> u32;

    fn producer(&self) -> Box<dyn JobQueueProducer>;

    /// Create a named consumer owning the given partitions.
    async fn consumer(
        &self,
        name: &str,
        partitions: Vec<u32>,
    ) -> Result<Box<dyn JobQueueConsumer>, QueueError>;
}

/// Round-robin assignment of partitions to `workers` consumers.
///
/// Every partition is owned by exactly one consumer, which is what keeps
/// per-client ordering: a client's partition is drained serially.
pub fn assign_partitions(partitions: u32, workers: usize) -> Vec<Vec<u32>> {
    let workers = workers.max(1);
    let mut assignment = vec![Vec::new(); workers];
    for p in 0..partitions {
        assignment[p as usize % workers].push(p);
    }
    assignment
}
