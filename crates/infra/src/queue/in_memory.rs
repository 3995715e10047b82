//! In-memory delivery channel for tests and local development.
//!
//! Mirrors the durable channel's contract: per-partition FIFO, delivered
//! messages stay in flight until committed, and `rewind` puts a
//! consumer's in-flight messages back at the head of their partitions so
//! they are fetched again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use jobflow_core::{ClientId, JobId};

use super::{
    partition_for, JobQueue, JobQueueConsumer, JobQueueProducer, QueueError, QueueMessage,
};

#[derive(Default)]
struct PartitionState {
    next_offset: u64,
    entries: VecDeque<QueueMessage>,
    in_flight: Vec<QueueMessage>,
}

pub struct InMemoryJobQueue {
    partitions: u32,
    shards: Arc<Vec<Mutex<PartitionState>>>,
}

impl InMemoryJobQueue {
    pub fn new(partitions: u32) -> Self {
        let partitions = partitions.max(1);
        let shards = (0..partitions).map(|_| Mutex::default()).collect();
        Self {
            partitions,
            shards: Arc::new(shards),
        }
    }

    /// Undelivered messages sitting in a partition.
    pub fn depth(&self, partition: u32) -> usize {
        self.shards[partition as usize].lock().unwrap().entries.len()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn partition_count(&self) -> u32 {
        self.partitions
    }

    fn producer(&self) -> Box<dyn JobQueueProducer> {
        Box::new(InMemoryProducer {
            partitions: self.partitions,
            shards: self.shards.clone(),
        })
    }

    async fn consumer(
        &self,
        _name: &str,
        partitions: Vec<u32>,
    ) -> Result<Box<dyn JobQueueConsumer>, QueueError> {
        Ok(Box::new(InMemoryConsumer {
            shards: self.shards.clone(),
            partitions,
            cursor: 0,
        }))
    }
}

struct InMemoryProducer {
    partitions: u32,
    shards: Arc<Vec<Mutex<PartitionState>>>,
}

#[async_trait]
impl JobQueueProducer for InMemoryProducer {
    async fn publish(&self, client_id: &ClientId, job_id: JobId) -> Result<u32, QueueError> {
        let partition = partition_for(client_id.as_str(), self.partitions);
        let mut state = self.shards[partition as usize].lock().unwrap();

        let offset = state.next_offset;
        state.next_offset += 1;
        state.entries.push_back(QueueMessage {
            partition,
            offset_id: format!("{:020}", offset),
            job_id,
            client_id: client_id.clone(),
        });
        Ok(partition)
    }
}

struct InMemoryConsumer {
    shards: Arc<Vec<Mutex<PartitionState>>>,
    partitions: Vec<u32>,
    cursor: usize,
}

#[async_trait]
impl JobQueueConsumer for InMemoryConsumer {
    async fn fetch(&mut self, _max_wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        if self.partitions.is_empty() {
            return Ok(None);
        }

        // Round-robin over owned partitions so one busy partition does
        // not starve the rest.
        for i in 0..self.partitions.len() {
            let idx = (self.cursor + i) % self.partitions.len();
            let partition = self.partitions[idx];
            let mut state = self.shards[partition as usize].lock().unwrap();
            if let Some(message) = state.entries.pop_front() {
                state.in_flight.push(message.clone());
                self.cursor = (idx + 1) % self.partitions.len();
                return Ok(Some(message));
            }
        }
        Ok(None)
    }

    async fn commit(&mut self, message: &QueueMessage) -> Result<(), QueueError> {
        let mut state = self.shards[message.partition as usize].lock().unwrap();
        state
            .in_flight
            .retain(|m| m.offset_id != message.offset_id);
        Ok(())
    }

    async fn rewind(&mut self) {
        // Partitions are exclusively owned, so every in-flight entry on
        // an owned partition was delivered to this consumer.
        for partition in &self.partitions {
            let mut state = self.shards[*partition as usize].lock().unwrap();
            let mut in_flight = std::mem::take(&mut state.in_flight);
            in_flight.sort_by(|a, b| a.offset_id.cmp(&b.offset_id));
            for message in in_flight.into_iter().rev() {
                state.entries.push_front(message);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::JobId;

    const NO_WAIT: Duration = Duration::from_millis(0);

    #[tokio::test]
    async fn same_client_always_lands_on_one_partition() {
        let queue = InMemoryJobQueue::new(16);
        let producer = queue.producer();
        let client = ClientId::from("client-7");

        let p1 = producer.publish(&client, JobId::new()).await.unwrap();
        let p2 = producer.publish(&client, JobId::new()).await.unwrap();
        assert_eq!(p1, p2);
        assert_eq!(queue.depth(p1), 2);
    }

    #[tokio::test]
    async fn fetch_preserves_per_partition_order() {
        let queue = InMemoryJobQueue::new(4);
        let producer = queue.producer();
        let client = ClientId::from("ordered");

        let first = JobId::new();
        let second = JobId::new();
        let partition = producer.publish(&client, first).await.unwrap();
        producer.publish(&client, second).await.unwrap();

        let mut consumer = queue.consumer("w0", vec![partition]).await.unwrap();
        let m1 = consumer.fetch(NO_WAIT).await.unwrap().unwrap();
        let m2 = consumer.fetch(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(m1.job_id, first);
        assert_eq!(m2.job_id, second);
    }

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered_in_order() {
        let queue = InMemoryJobQueue::new(1);
        let producer = queue.producer();
        let client = ClientId::from("c1");

        let first = JobId::new();
        let second = JobId::new();
        producer.publish(&client, first).await.unwrap();
        producer.publish(&client, second).await.unwrap();

        let mut consumer = queue.consumer("w0", vec![0]).await.unwrap();
        let m1 = consumer.fetch(NO_WAIT).await.unwrap().unwrap();
        consumer.commit(&m1).await.unwrap();
        let _m2 = consumer.fetch(NO_WAIT).await.unwrap().unwrap();
        // Second message was never committed.

        consumer.rewind().await;
        let redelivered = consumer.fetch(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(redelivered.job_id, second);
    }

    #[tokio::test]
    async fn rewind_redelivers_ahead_of_newer_messages() {
        let queue = InMemoryJobQueue::new(1);
        let producer = queue.producer();
        let client = ClientId::from("c1");

        let stuck = JobId::new();
        producer.publish(&client, stuck).await.unwrap();

        let mut consumer = queue.consumer("w0", vec![0]).await.unwrap();
        let delivered = consumer.fetch(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(delivered.job_id, stuck);

        // A later publish must not overtake the uncommitted message.
        let later = JobId::new();
        producer.publish(&client, later).await.unwrap();

        consumer.rewind().await;
        let first = consumer.fetch(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(first.job_id, stuck);
        consumer.commit(&first).await.unwrap();
        let second = consumer.fetch(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(second.job_id, later);
    }

    #[tokio::test]
    async fn consumers_only_see_their_own_partitions() {
        let queue = InMemoryJobQueue::new(2);
        let producer = queue.producer();

        // Find a client per partition.
        let mut clients = [None, None];
        for i in 0.. {
            let c = ClientId::from(format!("client-{}", i));
            let p = partition_for(c.as_str(), 2) as usize;
            if clients[p].is_none() {
                clients[p] = Some(c);
            }
            if clients.iter().all(Option::is_some) {
                break;
            }
        }
        let [c0, c1] = clients.map(Option::unwrap);
        producer.publish(&c0, JobId::new()).await.unwrap();
        producer.publish(&c1, JobId::new()).await.unwrap();

        let mut only_p0 = queue.consumer("w0", vec![0]).await.unwrap();
        let m = only_p0.fetch(NO_WAIT).await.unwrap().unwrap();
        assert_eq!(m.partition, 0);
        assert!(only_p0.fetch(NO_WAIT).await.unwrap().is_none());
    }
}
