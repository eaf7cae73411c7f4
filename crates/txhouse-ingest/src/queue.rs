//! Message queue abstraction.
//!
//! The pipeline reads from any [`QueueSource`]: an ordered, partitioned, replayable
//! log addressed by `(partition, offset)`. Membership changes arrive as
//! [`AssignmentEvent`]s on the channel returned by [`QueueSource::subscribe`].
//!
//! [`MemoryQueue`] is the in-process implementation used by the CLI loader and the
//! tests. It can inject transient outages to exercise the retry path.

use crate::error::{IngestError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use tokio::sync::mpsc;

/// One message as read from a queue partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub partition: u32,
    pub offset: u64,
    pub payload: Bytes,
}

/// A change to the set of queue partitions this consumer group member owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentEvent {
    Assigned(Vec<u32>),
    Revoked(Vec<u32>),
}

#[async_trait]
pub trait QueueSource: Send + Sync {
    /// Read up to `max` messages of `partition` starting at `offset`, in offset order.
    /// An empty vector means the partition has no messages at or after `offset` yet.
    async fn fetch(&self, partition: u32, offset: u64, max: usize) -> Result<Vec<QueueMessage>>;

    /// Join `group` and receive assignment changes.
    async fn subscribe(&self, group: &str) -> Result<mpsc::UnboundedReceiver<AssignmentEvent>>;

    fn topic(&self) -> &str;

    fn partition_count(&self) -> u32;
}

/// Drives membership for a source that has no broker-side coordinator.
pub trait PartitionAssignment {
    fn assign(&self, partitions: &[u32]);
    fn revoke(&self, partitions: &[u32]);
}

/// In-memory partitioned log.
pub struct MemoryQueue {
    topic: String,
    partitions: RwLock<Vec<Vec<Bytes>>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AssignmentEvent>>>,
    assigned: Mutex<BTreeSet<u32>>,
    available: AtomicBool,
    failures_pending: AtomicU32,
    next_partition: AtomicU64,
}

impl MemoryQueue {
    pub fn new(topic: impl Into<String>, partition_count: u32) -> Self {
        Self {
            topic: topic.into(),
            partitions: RwLock::new(vec![Vec::new(); partition_count.max(1) as usize]),
            subscribers: Mutex::new(Vec::new()),
            assigned: Mutex::new(BTreeSet::new()),
            available: AtomicBool::new(true),
            failures_pending: AtomicU32::new(0),
            next_partition: AtomicU64::new(0),
        }
    }

    /// Append a message and return its offset.
    pub fn publish(&self, partition: u32, payload: impl Into<Bytes>) -> Result<u64> {
        let mut partitions = self.partitions.write().unwrap_or_else(|p| p.into_inner());
        let log = partitions
            .get_mut(partition as usize)
            .ok_or(IngestError::UnknownPartition(partition))?;
        log.push(payload.into());
        Ok(log.len() as u64 - 1)
    }

    /// Spread messages over partitions in turn.
    pub fn publish_round_robin(&self, payload: impl Into<Bytes>) -> (u32, u64) {
        let count = self.partition_count() as u64;
        let partition = (self.next_partition.fetch_add(1, Ordering::Relaxed) % count) as u32;
        let mut partitions = self.partitions.write().unwrap_or_else(|p| p.into_inner());
        let log = &mut partitions[partition as usize];
        log.push(payload.into());
        (partition, log.len() as u64 - 1)
    }

    /// Offset the next published message of `partition` will get.
    pub fn high_watermark(&self, partition: u32) -> u64 {
        self.partitions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(partition as usize)
            .map_or(0, |log| log.len() as u64)
    }

    /// While unavailable every fetch fails with `QueueUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `count` fetches fail with `QueueUnavailable`.
    pub fn fail_next_fetches(&self, count: u32) {
        self.failures_pending.store(count, Ordering::SeqCst);
    }

    pub fn assigned(&self) -> Vec<u32> {
        self.assigned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .copied()
            .collect()
    }

    /// Assign every partition of the topic.
    pub fn assign_all(&self) {
        let all: Vec<u32> = (0..self.partition_count()).collect();
        self.assign(&all);
    }

    fn broadcast(&self, event: AssignmentEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[async_trait]
impl QueueSource for MemoryQueue {
    async fn fetch(&self, partition: u32, offset: u64, max: usize) -> Result<Vec<QueueMessage>> {
        let injected = self
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || !self.available.load(Ordering::SeqCst) {
            return Err(IngestError::QueueUnavailable(format!(
                "{} partition {} temporarily unavailable",
                self.topic, partition
            )));
        }

        let partitions = self.partitions.read().unwrap_or_else(|p| p.into_inner());
        let log = partitions
            .get(partition as usize)
            .ok_or(IngestError::UnknownPartition(partition))?;
        let start = (offset as usize).min(log.len());
        let end = start.saturating_add(max).min(log.len());
        Ok(log[start..end]
            .iter()
            .enumerate()
            .map(|(i, payload)| QueueMessage {
                partition,
                offset: (start + i) as u64,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn subscribe(&self, group: &str) -> Result<mpsc::UnboundedReceiver<AssignmentEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let current = self.assigned();
        if !current.is_empty() {
            let _ = tx.send(AssignmentEvent::Assigned(current));
        }
        self.subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(tx);
        tracing::debug!(topic = %self.topic, group, "subscriber joined");
        Ok(rx)
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition_count(&self) -> u32 {
        self.partitions
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len() as u32
    }
}

impl PartitionAssignment for MemoryQueue {
    fn assign(&self, partitions: &[u32]) {
        let added: Vec<u32> = {
            let mut assigned = self.assigned.lock().unwrap_or_else(|p| p.into_inner());
            partitions
                .iter()
                .copied()
                .filter(|p| *p < self.partition_count() && assigned.insert(*p))
                .collect()
        };
        if !added.is_empty() {
            self.broadcast(AssignmentEvent::Assigned(added));
        }
    }

    fn revoke(&self, partitions: &[u32]) {
        let removed: Vec<u32> = {
            let mut assigned = self.assigned.lock().unwrap_or_else(|p| p.into_inner());
            partitions
                .iter()
                .copied()
                .filter(|p| assigned.remove(p))
                .collect()
        };
        if !removed.is_empty() {
            self.broadcast(AssignmentEvent::Revoked(removed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fetch_in_offset_order() {
        let queue = MemoryQueue::new("transactions", 2);
        for i in 0..5 {
            queue.publish(1, format!("m{}", i)).unwrap();
        }

        let batch = queue.fetch(1, 2, 2).await.unwrap();
        assert_eq!(
            batch.iter().map(|m| m.offset).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(batch[0].payload, Bytes::from("m2"));
        assert!(queue.fetch(1, 5, 10).await.unwrap().is_empty());
        assert!(queue.fetch(0, 0, 10).await.unwrap().is_empty());
        assert!(matches!(
            queue.fetch(7, 0, 1).await,
            Err(IngestError::UnknownPartition(7))
        ));
    }

    #[tokio::test]
    async fn test_injected_outage() {
        let queue = MemoryQueue::new("transactions", 1);
        queue.publish(0, "x").unwrap();
        queue.fail_next_fetches(2);

        assert!(queue.fetch(0, 0, 1).await.unwrap_err().is_retryable());
        assert!(queue.fetch(0, 0, 1).await.is_err());
        assert_eq!(queue.fetch(0, 0, 1).await.unwrap().len(), 1);

        queue.set_available(false);
        assert!(queue.fetch(0, 0, 1).await.unwrap_err().is_retryable());
        queue.set_available(true);
        assert!(queue.fetch(0, 0, 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_assignment_events() {
        let queue = MemoryQueue::new("transactions", 3);
        queue.assign(&[0]);
        let mut events = queue.subscribe("g").await.unwrap();
        assert_eq!(events.recv().await, Some(AssignmentEvent::Assigned(vec![0])));

        queue.assign(&[0, 1, 9]);
        assert_eq!(events.recv().await, Some(AssignmentEvent::Assigned(vec![1])));
        queue.revoke(&[1, 2]);
        assert_eq!(events.recv().await, Some(AssignmentEvent::Revoked(vec![1])));
        assert_eq!(queue.assigned(), vec![0]);
    }

    #[test]
    fn test_round_robin() {
        let queue = MemoryQueue::new("transactions", 2);
        assert_eq!(queue.publish_round_robin("a"), (0, 0));
        assert_eq!(queue.publish_round_robin("b"), (1, 0));
        assert_eq!(queue.publish_round_robin("c"), (0, 1));
        assert_eq!(queue.high_watermark(0), 2);
    }
}
