//! Ingestion Pipeline
//!
//! Connects a [`QueueSource`] to a [`PartitionedStore`] with at-least-once delivery.
//!
//! ## Architecture
//!
//! ```text
//!  queue partition 0 ──► consumer task ─┐
//!  queue partition 1 ──► consumer task ─┼─► intake (bounded mpsc) ──► dispatcher
//!  queue partition N ──► consumer task ─┘                                │ route by partition_key
//!                              ▲                        ┌────────────────┼────────────────┐
//!                              │                        ▼                ▼                ▼
//!                        commit offsets           shard 201901     shard 201902     shard ...
//!                        up to frontier           (Materializer, bounded mpsc each)
//!                              ▲                        │ run durable
//!                              └──── AckTracker ◄───────┘
//! ```
//!
//! - One consumer task per assigned queue partition. It polls, decodes and sends
//!   batches to the dispatcher, and commits offsets as the ack frontier advances.
//! - The dispatcher routes rows to one shard task per storage partition. Shards
//!   write independently; a slow or failed partition never blocks another shard's
//!   writes. A full shard queue does stall the dispatcher, which in turn stalls
//!   the consumers.
//! - A shard whose write fails stops. Its batches are never acknowledged, so the
//!   affected queue partitions stop committing and replay from the last commit
//!   after a restart.
//!
//! ## Shutdown
//!
//! Consumers stop polling and finish sending their in-flight batch. The dispatcher
//! drains the intake queue, every shard seals its active run, and consumers commit
//! the final frontier. Anything not durable within `shutdown_timeout_ms` is left
//! uncommitted.
//!
//! ## Delivery semantics
//!
//! A crash after a run is durable but before its offsets are committed replays
//! those messages, so storage may hold duplicate rows. They are not removed.

use crate::ack::AckTracker;
use crate::config::IngestConfig;
use crate::consumer::{IntakeBatch, PartitionConsumer};
use crate::error::{IngestError, Result};
use crate::materializer::{route, Materializer};
use crate::offsets::OffsetStore;
use crate::queue::{AssignmentEvent, QueueSource};
use crate::stats::{IngestStats, IngestStatsSnapshot};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use txhouse_core::MaterializedRow;
use txhouse_storage::PartitionedStore;

/// Shared by every task of one pipeline.
struct Context {
    config: IngestConfig,
    queue: Arc<dyn QueueSource>,
    offsets: Arc<dyn OffsetStore>,
    store: Arc<PartitionedStore>,
    tracker: AckTracker,
    stats: Arc<IngestStats>,
    flush: broadcast::Sender<()>,
    assigned: Mutex<BTreeSet<u32>>,
}

struct ShardBatch {
    id: u64,
    rows: Vec<MaterializedRow>,
}

struct ConsumerHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct IngestPipeline {
    ctx: Arc<Context>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl IngestPipeline {
    pub fn new(
        config: IngestConfig,
        queue: Arc<dyn QueueSource>,
        offsets: Arc<dyn OffsetStore>,
        store: Arc<PartitionedStore>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let (flush, _) = broadcast::channel(16);
        Arc::new(Self {
            ctx: Arc::new(Context {
                config,
                queue,
                offsets,
                store,
                tracker: AckTracker::new(),
                stats: Arc::new(IngestStats::default()),
                flush,
                assigned: Mutex::new(BTreeSet::new()),
            }),
            shutdown,
            task: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &IngestConfig {
        &self.ctx.config
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Queue partitions with a running consumer.
    pub fn assigned_partitions(&self) -> Vec<u32> {
        self.ctx
            .assigned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .copied()
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Join the consumer group and start consuming assigned partitions.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(IngestError::AlreadyRunning);
        }
        let events = self.ctx.queue.subscribe(&self.ctx.config.group_id).await?;
        self.shutdown.send_replace(false);

        let ctx = self.ctx.clone();
        let shutdown_rx = self.shutdown.subscribe();
        let task = tokio::spawn(supervise(ctx, events, shutdown_rx));
        *self.task.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);

        tracing::info!(
            topic = %self.ctx.queue.topic(),
            group = %self.ctx.config.group_id,
            "ingest pipeline started"
        );
        Ok(())
    }

    /// Ask every shard to seal its active run now.
    pub fn flush(&self) {
        let _ = self.ctx.flush.send(());
    }

    /// Wait until every partition in `targets` has committed at least the given
    /// offset, flushing shards while waiting. Returns `false` on timeout.
    pub async fn wait_for_offsets(
        &self,
        targets: &BTreeMap<u32, u64>,
        timeout: Duration,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut caught_up = true;
            for (partition, target) in targets {
                let committed = self
                    .ctx
                    .offsets
                    .committed(&self.ctx.config.group_id, *partition)
                    .await?
                    .unwrap_or(0);
                if committed < *target {
                    caught_up = false;
                    break;
                }
            }
            if caught_up {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            self.flush();
            time::sleep(self.ctx.config.poll_interval()).await;
        }
    }

    /// Stop consuming, drain in-flight work and commit what became durable.
    pub async fn shutdown(&self) -> Result<()> {
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        let Some(task) = task else {
            return Err(IngestError::PipelineStopped);
        };
        self.shutdown.send_replace(true);
        if let Err(e) = task.await {
            tracing::error!(error = %e, "ingest supervisor panicked");
        }
        tracing::info!(stats = ?self.ctx.stats.snapshot(), "ingest pipeline stopped");
        Ok(())
    }
}

async fn supervise(
    ctx: Arc<Context>,
    mut events: mpsc::UnboundedReceiver<AssignmentEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (intake_tx, intake_rx) = mpsc::channel(ctx.config.intake_capacity.max(1));
    let dispatcher = tokio::spawn(dispatch(ctx.clone(), intake_rx));
    let mut consumers: HashMap<u32, ConsumerHandle> = HashMap::new();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(AssignmentEvent::Assigned(partitions)) => {
                    for partition in partitions {
                        if consumers.contains_key(&partition) {
                            continue;
                        }
                        let (stop, stop_rx) = watch::channel(false);
                        let task = tokio::spawn(consume(
                            ctx.clone(),
                            partition,
                            intake_tx.clone(),
                            stop_rx,
                        ));
                        consumers.insert(partition, ConsumerHandle { stop, task });
                        set_assigned(&ctx, partition, true);
                        tracing::info!(partition, "queue partition assigned");
                    }
                }
                Some(AssignmentEvent::Revoked(partitions)) => {
                    for partition in partitions {
                        if let Some(handle) = consumers.remove(&partition) {
                            handle.stop.send_replace(true);
                            let _ = ctx.flush.send(());
                            if let Err(e) = handle.task.await {
                                tracing::error!(partition, error = %e, "consumer task panicked");
                            }
                            set_assigned(&ctx, partition, false);
                            tracing::info!(partition, "queue partition revoked");
                        }
                    }
                }
                None => {
                    tracing::warn!("assignment channel closed");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    for handle in consumers.values() {
        handle.stop.send_replace(true);
    }
    // Consumers keep their own senders until their last batch is handed over.
    drop(intake_tx);
    if let Err(e) = dispatcher.await {
        tracing::error!(error = %e, "dispatcher panicked");
    }
    for (partition, handle) in consumers {
        if let Err(e) = handle.task.await {
            tracing::error!(partition, error = %e, "consumer task panicked");
        }
        set_assigned(&ctx, partition, false);
    }
}

fn set_assigned(ctx: &Context, partition: u32, assigned: bool) {
    let mut set = ctx.assigned.lock().unwrap_or_else(|p| p.into_inner());
    if assigned {
        set.insert(partition);
    } else {
        set.remove(&partition);
    }
}

async fn consume(
    ctx: Arc<Context>,
    partition: u32,
    intake: mpsc::Sender<IntakeBatch>,
    mut stop: watch::Receiver<bool>,
) {
    let group = ctx.config.group_id.clone();
    let start = match ctx.offsets.committed(&group, partition).await {
        Ok(offset) => offset.unwrap_or(0),
        Err(e) => {
            tracing::error!(partition, error = %e, "cannot read committed offset");
            return;
        }
    };
    tracing::debug!(partition, start, "consumer starting");

    let mut frontier = ctx.tracker.watch_partition(partition);
    let mut consumer = PartitionConsumer::new(
        ctx.queue.clone(),
        partition,
        start,
        ctx.config.retry.clone(),
        ctx.config.skip_malformed,
    );
    let mut committed = start;
    let mut delivered = start;
    let mut halted = false;

    while !*stop.borrow() {
        commit_frontier(&ctx, &group, partition, &mut frontier, &mut committed).await;

        if halted {
            tokio::select! {
                _ = stop.changed() => {}
                _ = frontier.changed() => {}
            }
            continue;
        }

        match consumer.next_batch(ctx.config.max_batch).await {
            Ok(Some(batch)) => {
                let last = batch.last_offset;
                ctx.tracker.open(batch.id, partition, last);
                if intake.send(batch).await.is_err() {
                    tracing::warn!(partition, "dispatcher gone, consumer stopping");
                    break;
                }
                delivered = last + 1;
            }
            Ok(None) => {
                tokio::select! {
                    _ = time::sleep(ctx.config.poll_interval()) => {}
                    _ = stop.changed() => {}
                }
            }
            Err(e @ IngestError::MalformedHalt { .. }) => {
                tracing::error!(partition, error = %e, "queue partition halted");
                ctx.stats.record_halted_queue_partition(partition);
                halted = true;
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(partition, error = %e, "queue still unavailable, backing off");
                tokio::select! {
                    _ = time::sleep(ctx.config.retry.max_backoff()) => {}
                    _ = stop.changed() => {}
                }
            }
            Err(e) => {
                tracing::error!(partition, error = %e, "consumer failed");
                halted = true;
            }
        }
    }
    drop(intake);

    // Wait for in-flight batches to become durable, then make the final commit.
    let deadline = Instant::now() + ctx.config.shutdown_timeout();
    loop {
        commit_frontier(&ctx, &group, partition, &mut frontier, &mut committed).await;
        if committed >= delivered {
            break;
        }
        match time::timeout_at(deadline, frontier.changed()).await {
            Ok(Ok(())) => continue,
            _ => break,
        }
    }
    if committed < delivered {
        tracing::warn!(
            partition,
            committed,
            delivered,
            "shutting down with uncommitted messages; they will be replayed"
        );
    }
    ctx.tracker.forget_partition(partition);
    tracing::debug!(partition, committed, "consumer stopped");
}

async fn commit_frontier(
    ctx: &Context,
    group: &str,
    partition: u32,
    frontier: &mut watch::Receiver<Option<u64>>,
    committed: &mut u64,
) {
    let Some(last) = *frontier.borrow_and_update() else {
        return;
    };
    let next = last + 1;
    if next <= *committed {
        return;
    }
    match ctx.offsets.commit(group, partition, next).await {
        Ok(()) => {
            *committed = next;
            ctx.stats.record_commit();
            tracing::trace!(partition, offset = next, "offset committed");
        }
        Err(e) => tracing::warn!(partition, offset = next, error = %e, "offset commit failed"),
    }
}

async fn dispatch(ctx: Arc<Context>, mut intake: mpsc::Receiver<IntakeBatch>) {
    let mut shards: HashMap<u32, (mpsc::Sender<ShardBatch>, JoinHandle<()>)> = HashMap::new();

    while let Some(batch) = intake.recv().await {
        let messages = batch.len();
        let routed = route(batch.deliveries);
        ctx.stats
            .record_batch(messages, routed.accepted, routed.skipped);

        for (partition_key, rows) in routed.rows {
            let (tx, _) = shards
                .entry(partition_key)
                .or_insert_with(|| spawn_shard(ctx.clone(), partition_key));
            ctx.tracker.retain(batch.id);
            if tx.send(ShardBatch { id: batch.id, rows }).await.is_err() {
                // The shard stopped after a write failure; the hold is never released.
                tracing::debug!(
                    partition = partition_key,
                    batch = batch.id,
                    "dropping rows for failed partition"
                );
            }
        }
        ctx.tracker.release(batch.id);
    }

    for (partition_key, (tx, task)) in shards {
        drop(tx);
        if let Err(e) = task.await {
            tracing::error!(partition = partition_key, error = %e, "shard panicked");
        }
    }
}

fn spawn_shard(ctx: Arc<Context>, partition_key: u32) -> (mpsc::Sender<ShardBatch>, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(ctx.config.shard_capacity.max(1));
    let task = tokio::spawn(run_shard(ctx, partition_key, rx));
    tracing::debug!(partition = partition_key, "shard started");
    (tx, task)
}

async fn run_shard(ctx: Arc<Context>, partition_key: u32, mut rx: mpsc::Receiver<ShardBatch>) {
    let mut materializer =
        Materializer::new(ctx.store.clone(), &ctx.config).with_stats(ctx.stats.clone());
    let mut flush = ctx.flush.subscribe();
    let mut flush_open = true;
    let mut ticker = time::interval(ctx.config.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let result = tokio::select! {
            batch = rx.recv() => match batch {
                Some(batch) => materializer.append(batch.id, partition_key, batch.rows).await,
                None => break,
            },
            _ = ticker.tick() => materializer.flush_expired().await,
            signal = flush.recv(), if flush_open => match signal {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => materializer.flush_all().await,
                Err(broadcast::error::RecvError::Closed) => {
                    flush_open = false;
                    continue;
                }
            },
        };
        match result {
            Ok(durable) => acknowledge(&ctx, durable),
            Err(e) => {
                fail_shard(&ctx, partition_key, &e);
                return;
            }
        }
    }

    match materializer.flush_all().await {
        Ok(durable) => acknowledge(&ctx, durable),
        Err(e) => fail_shard(&ctx, partition_key, &e),
    }
    tracing::debug!(partition = partition_key, "shard stopped");
}

fn acknowledge(ctx: &Context, durable: Vec<u64>) {
    for id in durable {
        ctx.tracker.release(id);
    }
}

fn fail_shard(ctx: &Context, partition_key: u32, error: &IngestError) {
    tracing::error!(
        partition = partition_key,
        error = %error,
        "storage partition halted; its messages will not be committed"
    );
    ctx.stats.record_failed_partition(partition_key);
}
