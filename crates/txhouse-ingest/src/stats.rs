//! Ingestion counters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct IngestStats {
    messages: AtomicU64,
    accepted: AtomicU64,
    skipped: AtomicU64,
    batches: AtomicU64,
    runs_written: AtomicU64,
    rows_written: AtomicU64,
    commits: AtomicU64,
    failed_partitions: Mutex<BTreeSet<u32>>,
    halted_queue_partitions: Mutex<BTreeSet<u32>>,
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStatsSnapshot {
    pub messages: u64,
    pub accepted: u64,
    pub skipped: u64,
    pub batches: u64,
    pub runs_written: u64,
    pub rows_written: u64,
    pub commits: u64,
    /// Storage partitions whose shard stopped after a write failure
    pub failed_partitions: Vec<u32>,
    /// Queue partitions stopped in front of a malformed message
    pub halted_queue_partitions: Vec<u32>,
}

impl IngestStats {
    pub fn record_batch(&self, messages: usize, accepted: usize, skipped: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.messages.fetch_add(messages as u64, Ordering::Relaxed);
        self.accepted.fetch_add(accepted as u64, Ordering::Relaxed);
        self.skipped.fetch_add(skipped as u64, Ordering::Relaxed);
    }

    pub fn record_run(&self, rows: u64) {
        self.runs_written.fetch_add(1, Ordering::Relaxed);
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed_partition(&self, partition_key: u32) {
        self.failed_partitions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(partition_key);
    }

    pub fn record_halted_queue_partition(&self, partition: u32) {
        self.halted_queue_partitions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(partition);
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            messages: self.messages.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            runs_written: self.runs_written.load(Ordering::Relaxed),
            rows_written: self.rows_written.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            failed_partitions: self
                .failed_partitions
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .copied()
                .collect(),
            halted_queue_partitions: self
                .halted_queue_partitions
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .copied()
                .collect(),
        }
    }
}
