//! Batch acknowledgement tracking.
//!
//! A batch from a queue partition may fan out to several storage shards. It is
//! acknowledged once every shard holding some of its rows has made them durable.
//! Per queue partition the tracker publishes a *frontier*: the last offset below
//! which every batch is acknowledged. Offsets are committed only up to the
//! frontier, so a batch that is never acknowledged (its shard failed) blocks
//! commits for its partition and is replayed after a restart.
//!
//! ```text
//! batches (partition 0):  [0..=99 acked] [100..=199 pending] [200..=299 acked]
//! frontier:               99
//! ```
//!
//! Every batch is opened with one hold owned by the dispatcher. The dispatcher
//! adds one hold per shard it sends rows to, then releases its own.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Debug)]
struct PendingBatch {
    partition: u32,
    last_offset: u64,
    holds: usize,
}

#[derive(Debug, Default)]
struct Inner {
    batches: HashMap<u64, PendingBatch>,
    order: HashMap<u32, VecDeque<u64>>,
    frontiers: HashMap<u32, watch::Sender<Option<u64>>>,
}

#[derive(Debug, Default)]
pub struct AckTracker {
    inner: Mutex<Inner>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Watch the frontier of `partition`. `None` until the first batch is acknowledged.
    pub fn watch_partition(&self, partition: u32) -> watch::Receiver<Option<u64>> {
        let mut inner = self.lock();
        inner
            .frontiers
            .entry(partition)
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Forget a partition after its final commit.
    pub fn forget_partition(&self, partition: u32) {
        let mut inner = self.lock();
        if let Some(ids) = inner.order.remove(&partition) {
            for id in ids {
                inner.batches.remove(&id);
            }
        }
        inner.frontiers.remove(&partition);
    }

    /// Start tracking a batch with the dispatcher's hold. Batches of one partition
    /// must be opened in offset order.
    pub fn open(&self, batch_id: u64, partition: u32, last_offset: u64) {
        let mut inner = self.lock();
        inner.batches.insert(
            batch_id,
            PendingBatch {
                partition,
                last_offset,
                holds: 1,
            },
        );
        inner.order.entry(partition).or_default().push_back(batch_id);
    }

    /// Add a hold for one more shard.
    pub fn retain(&self, batch_id: u64) {
        if let Some(batch) = self.lock().batches.get_mut(&batch_id) {
            batch.holds += 1;
        }
    }

    /// Drop one hold. When the last hold goes the frontier may advance.
    pub fn release(&self, batch_id: u64) {
        let mut inner = self.lock();
        let partition = match inner.batches.get_mut(&batch_id) {
            Some(batch) => {
                batch.holds = batch.holds.saturating_sub(1);
                if batch.holds > 0 {
                    return;
                }
                batch.partition
            }
            None => return,
        };
        advance(&mut inner, partition);
    }

    pub fn pending(&self, partition: u32) -> usize {
        self.lock().order.get(&partition).map_or(0, VecDeque::len)
    }
}

fn advance(inner: &mut Inner, partition: u32) {
    let mut frontier = None;
    if let Some(order) = inner.order.get_mut(&partition) {
        while let Some(id) = order.front().copied() {
            match inner.batches.get(&id) {
                Some(batch) if batch.holds > 0 => break,
                Some(batch) => {
                    frontier = Some(batch.last_offset);
                    inner.batches.remove(&id);
                    order.pop_front();
                }
                None => {
                    order.pop_front();
                }
            }
        }
    }
    if let Some(offset) = frontier {
        inner
            .frontiers
            .entry(partition)
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(Some(offset));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontier_waits_for_earlier_batches() {
        let tracker = AckTracker::new();
        let frontier = tracker.watch_partition(0);

        tracker.open(1, 0, 99);
        tracker.open(2, 0, 199);
        tracker.open(3, 0, 299);
        tracker.retain(1);
        tracker.release(1);

        tracker.release(2);
        tracker.release(3);
        assert_eq!(*frontier.borrow(), None);

        tracker.release(1);
        assert_eq!(*frontier.borrow(), Some(299));
        assert_eq!(tracker.pending(0), 0);
    }

    #[test]
    fn test_batch_with_several_shards() {
        let tracker = AckTracker::new();
        let frontier = tracker.watch_partition(4);

        tracker.open(10, 4, 9);
        tracker.retain(10);
        tracker.retain(10);
        tracker.release(10);
        tracker.release(10);
        assert_eq!(*frontier.borrow(), None);
        tracker.release(10);
        assert_eq!(*frontier.borrow(), Some(9));
    }

    #[test]
    fn test_partitions_are_independent() {
        let tracker = AckTracker::new();
        let p0 = tracker.watch_partition(0);
        let p1 = tracker.watch_partition(1);

        tracker.open(1, 0, 5);
        tracker.retain(1);
        tracker.open(2, 1, 7);
        tracker.release(1);
        tracker.release(2);

        assert_eq!(*p0.borrow(), None);
        assert_eq!(*p1.borrow(), Some(7));
    }
}
