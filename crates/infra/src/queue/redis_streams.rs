//! Redis Streams-backed delivery channel.
//!
//! One stream per partition (`jobflow:queue:{n}`), all read through the
//! shared consumer group. XADD appends, XREADGROUP delivers, XACK
//! commits. A consumer first drains its own pending entries (id `0`)
//! before asking for new ones (`>`), so uncommitted messages survive a
//! worker restart.
//!
//! Each consumer holds its own connection: XREADGROUP blocks, and a
//! blocking read must not stall the shared multiplexed pipe the producer
//! uses.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, instrument, warn};

use jobflow_core::{ClientId, JobId};

use super::{
    partition_for, JobQueue, JobQueueConsumer, JobQueueProducer, QueueError, QueueMessage,
    CONSUMER_GROUP,
};

const STREAM_PREFIX: &str = "jobflow:queue:";

fn stream_key(partition: u32) -> String {
    format!("{}{}", STREAM_PREFIX, partition)
}

fn map_redis_error(e: redis::RedisError) -> QueueError {
    if e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        QueueError::Connection(e.to_string())
    } else {
        QueueError::Command(e.to_string())
    }
}

pub struct RedisJobQueue {
    client: redis::Client,
    conn: ConnectionManager,
    partitions: u32,
}

impl RedisJobQueue {
    /// Connect and make sure the consumer group exists on every
    /// partition stream (idempotent, MKSTREAM creates missing streams).
    pub async fn connect(redis_url: &str, partitions: u32) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let mut conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let partitions = partitions.max(1);
        for p in 0..partitions {
            // BUSYGROUP on re-creation is expected and ignored.
            let _: Result<String, _> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(stream_key(p))
                .arg(CONSUMER_GROUP)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;
        }

        Ok(Self {
            client,
            conn,
            partitions,
        })
    }
}

#[async_trait]
impl JobQueue for RedisJobQueue {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    fn producer(&self) -> Box<dyn JobQueueProducer> {
        Box::new(RedisQueueProducer {
            conn: self.conn.clone(),
            partitions: self.partitions,
        })
    }

    async fn consumer(
        &self,
        name: &str,
        partitions: Vec<u32>,
    ) -> Result<Box<dyn JobQueueConsumer>, QueueError> {
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let keys: Vec<String> = partitions.iter().copied().map(stream_key).collect();
        Ok(Box::new(RedisQueueConsumer {
            conn,
            name: name.to_string(),
            keys,
            backlog_drained: false,
        }))
    }
}

pub struct RedisQueueProducer {
    conn: ConnectionManager,
    partitions: u32,
}

#[async_trait]
impl JobQueueProducer for RedisQueueProducer {
    #[instrument(skip(self), fields(client_id = %client_id, job_id = %job_id), err)]
    async fn publish(&self, client_id: &ClientId, job_id: JobId) -> Result<u32, QueueError> {
        let partition = partition_for(client_id.as_str(), self.partitions);
        let mut conn = self.conn.clone();

        let offset_id: String = redis::cmd("XADD")
            .arg(stream_key(partition))
            .arg("*")
            .arg("job_id")
            .arg(job_id.to_string())
            .arg("client_id")
            .arg(client_id.as_str())
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;

        debug!(partition, offset_id = %offset_id, "job published");
        Ok(partition)
    }
}

pub struct RedisQueueConsumer {
    conn: MultiplexedConnection,
    name: String,
    keys: Vec<String>,
    backlog_drained: bool,
}

impl RedisQueueConsumer {
    async fn read_one(
        &mut self,
        backlog: bool,
        max_wait: Duration,
    ) -> Result<Option<QueueMessage>, QueueError> {
        let mut opts = StreamReadOptions::default()
            .group(CONSUMER_GROUP, &self.name)
            .count(1);
        if !backlog {
            opts = opts.block(max_wait.as_millis() as usize);
        }

        let ids: Vec<&str> = self
            .keys
            .iter()
            .map(|_| if backlog { "0" } else { ">" })
            .collect();

        // Poison entries are acked and dropped, then the read is retried;
        // each pass discards at most one, so the loop terminates.
        loop {
            let reply: StreamReadReply = self
                .conn
                .xread_options(&self.keys, &ids, &opts)
                .await
                .map_err(map_redis_error)?;

            let mut discarded = false;
            for stream in reply.keys {
                let partition = parse_partition(&stream.key)?;
                if let Some(entry) = stream.ids.into_iter().next() {
                    match decode_entry(partition, entry) {
                        Ok(message) => return Ok(Some(message)),
                        Err((offset_id, e)) => {
                            warn!(
                                consumer = %self.name,
                                offset_id = %offset_id,
                                error = %e,
                                "unparsable queue entry, discarding"
                            );
                            let _: u64 = self
                                .conn
                                .xack(stream_key(partition), CONSUMER_GROUP, &[&offset_id])
                                .await
                                .map_err(map_redis_error)?;
                            discarded = true;
                            break;
                        }
                    }
                }
            }
            if !discarded {
                return Ok(None);
            }
        }
    }
}

fn decode_entry(
    partition: u32,
    entry: redis::streams::StreamId,
) -> Result<QueueMessage, (String, QueueError)> {
    let decode = |entry: &redis::streams::StreamId| -> Result<(JobId, ClientId), QueueError> {
        let job_id = field_string(&entry.map, "job_id")?
            .parse()
            .map_err(|e| QueueError::Decode(format!("bad job_id: {}", e)))?;
        let client_id = ClientId::from(field_string(&entry.map, "client_id")?);
        Ok((job_id, client_id))
    };

    match decode(&entry) {
        Ok((job_id, client_id)) => Ok(QueueMessage {
            partition,
            offset_id: entry.id,
            job_id,
            client_id,
        }),
        Err(e) => Err((entry.id, e)),
    }
}

fn parse_partition(key: &str) -> Result<u32, QueueError> {
    key.strip_prefix(STREAM_PREFIX)
        .and_then(|suffix| suffix.parse().ok())
        .ok_or_else(|| QueueError::Decode(format!("unexpected stream key {}", key)))
}

fn field_string(
    map: &std::collections::HashMap<String, redis::Value>,
    field: &str,
) -> Result<String, QueueError> {
    let value = map
        .get(field)
        .ok_or_else(|| QueueError::Decode(format!("missing {} field", field)))?;
    redis::from_redis_value(value)
        .map_err(|e| QueueError::Decode(format!("bad {} field: {}", field, e)))
}

#[async_trait]
impl JobQueueConsumer for RedisQueueConsumer {
    async fn fetch(&mut self, max_wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        if self.keys.is_empty() {
            return Ok(None);
        }

        if !self.backlog_drained {
            if let Some(message) = self.read_one(true, max_wait).await? {
                debug!(consumer = %self.name, offset_id = %message.offset_id, "redelivering pending message");
                return Ok(Some(message));
            }
            self.backlog_drained = true;
        }

        self.read_one(false, max_wait).await
    }

    async fn commit(&mut self, message: &QueueMessage) -> Result<(), QueueError> {
        let _: u64 = self
            .conn
            .xack(
                stream_key(message.partition),
                CONSUMER_GROUP,
                &[&message.offset_id],
            )
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }

    async fn rewind(&mut self) {
        // Unacked entries live in this consumer's pending entries list;
        // re-arming the backlog read (id `0`) is enough to see them again.
        self.backlog_drained = false;
    }
}
