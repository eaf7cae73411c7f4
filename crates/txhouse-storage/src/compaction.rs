//! Background Compaction
//!
//! Ingestion writes many small runs. The scheduler periodically merges them so scans
//! touch fewer files and skip indexes cover larger runs.
//!
//! ## Strategy
//!
//! - Every `interval_ms` the scheduler looks at each partition.
//! - A partition with at least `min_runs` live runs is compacted in its own task;
//!   partitions never wait on each other.
//! - At most one compaction per partition is in flight. A manual [`trigger`] while one
//!   is running fails with `CompactionInProgress`.
//!
//! ## Lifecycle
//!
//! ```ignore
//! let scheduler = CompactionScheduler::new(store.clone(), CompactionConfig::default());
//! scheduler.start();
//! // ...
//! scheduler.stop().await;
//! ```
//!
//! [`trigger`]: CompactionScheduler::trigger

use crate::error::{Error, Result};
use crate::store::{CompactionOutcome, PartitionedStore};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, MissedTickBehavior};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Pause between scheduler passes in milliseconds (default: 30s)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Live runs a partition needs before it is compacted automatically (default: 4)
    #[serde(default = "default_min_runs")]
    pub min_runs: usize,
}

fn default_interval_ms() -> u64 {
    30_000
}

fn default_min_runs() -> usize {
    4
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            min_runs: default_min_runs(),
        }
    }
}

impl CompactionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Aggregate statistics for the compaction scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionStats {
    pub passes: u64,
    pub compactions: u64,
    pub runs_merged: u64,
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    passes: AtomicU64,
    compactions: AtomicU64,
    runs_merged: AtomicU64,
    failures: AtomicU64,
}

/// Removes a partition from the in-flight set when the compaction ends.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashSet<u32>>>,
    partition_key: u32,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.partition_key);
    }
}

pub struct CompactionScheduler {
    store: Arc<PartitionedStore>,
    config: CompactionConfig,
    in_flight: Arc<Mutex<HashSet<u32>>>,
    counters: Arc<Counters>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CompactionScheduler {
    pub fn new(store: Arc<PartitionedStore>, config: CompactionConfig) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            store,
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            counters: Arc::new(Counters::default()),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// Start the periodic background pass. Returns `false` if already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_some() {
            return false;
        }
        self.shutdown.send_replace(false);

        let this = self.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        *task = Some(tokio::spawn(async move {
            let mut ticker = time::interval(this.config.interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it so start() is cheap.
            ticker.tick().await;

            tracing::info!(
                table = %this.store.schema().name,
                interval_ms = this.config.interval_ms,
                min_runs = this.config.min_runs,
                "compaction scheduler started"
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tracing::trace!("compaction tick");
                        this.run_pass().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            tracing::info!(table = %this.store.schema().name, "compaction scheduler stopped");
        }));
        true
    }

    /// Stop the background pass and wait for it to finish its current work.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            self.shutdown.send_replace(true);
            if let Err(e) = task.await {
                tracing::error!(error = %e, "compaction scheduler task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    fn claim(&self, partition_key: u32) -> Option<InFlightGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !in_flight.insert(partition_key) {
            return None;
        }
        Some(InFlightGuard {
            in_flight: self.in_flight.clone(),
            partition_key,
        })
    }

    /// Compact one partition now, regardless of its run count.
    pub async fn trigger(&self, partition_key: u32) -> Result<Option<CompactionOutcome>> {
        let _guard = self
            .claim(partition_key)
            .ok_or(Error::CompactionInProgress(partition_key))?;
        let outcome = self.store.compact(partition_key).await;
        record(&self.counters, &outcome);
        outcome
    }

    /// One scheduler pass: compact every eligible partition concurrently.
    /// Returns the number of partitions compacted.
    pub async fn run_pass(&self) -> usize {
        self.counters.passes.fetch_add(1, Ordering::Relaxed);

        let mut tasks = JoinSet::new();
        for info in self.store.list_partitions().await {
            if info.runs < self.config.min_runs.max(2) {
                continue;
            }
            let Some(guard) = self.claim(info.partition_key) else {
                continue;
            };
            let store = self.store.clone();
            let counters = self.counters.clone();
            tasks.spawn(async move {
                let _guard = guard;
                let outcome = store.compact(info.partition_key).await;
                record(&counters, &outcome);
                if let Err(e) = &outcome {
                    tracing::error!(partition = info.partition_key, error = %e, "compaction failed");
                }
                matches!(outcome, Ok(Some(_)))
            });
        }

        let mut compacted = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => compacted += 1,
                Ok(false) => {}
                Err(e) => tracing::error!(error = %e, "compaction task panicked"),
            }
        }
        compacted
    }

    pub fn stats(&self) -> CompactionStats {
        CompactionStats {
            passes: self.counters.passes.load(Ordering::Relaxed),
            compactions: self.counters.compactions.load(Ordering::Relaxed),
            runs_merged: self.counters.runs_merged.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }
}

fn record(counters: &Counters, outcome: &Result<Option<CompactionOutcome>>) {
    match outcome {
        Ok(Some(o)) => {
            counters.compactions.fetch_add(1, Ordering::Relaxed);
            counters
                .runs_merged
                .fetch_add(o.runs_merged as u64, Ordering::Relaxed);
        }
        Ok(None) => {}
        Err(_) => {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
    }
}
