//! Materializer
//!
//! Turns decoded rows into durable sorted runs.
//!
//! ## Flow
//!
//! ```text
//! Delivery::Row ──► derive transaction_date, partition_key
//!                      │
//!                      ▼
//!         ActiveRun per partition (in memory, arrival order)
//!                      │  run_max_rows reached, or older than run_max_age
//!                      ▼
//!         seal (sort by ordering key) ──► PartitionedStore::write
//! ```
//!
//! ## Durability tracking
//!
//! Each batch carries a hold count: one per active run holding its rows, plus one
//! for as long as the batch is still being appended. A batch is reported durable
//! when the count reaches zero, so a run sealed halfway through a batch never
//! reports it while the rest of its rows are still buffered. A batch with no rows
//! at all (every message malformed) is durable immediately.
//!
//! A failed write returns the error and discards the sealed run. Its batches are
//! never reported durable, so their offsets are not committed and the rows are
//! replayed after a restart.

use crate::config::IngestConfig;
use crate::consumer::{Delivery, IntakeBatch};
use crate::error::Result;
use crate::stats::IngestStats;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use txhouse_core::MaterializedRow;
use txhouse_storage::{ActiveRun, PartitionedStore};

/// What one [`Materializer::apply`] call did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeResult {
    pub accepted: usize,
    pub skipped: usize,
    /// Batches whose rows are now all durable, this one or earlier ones
    pub durable_batches: Vec<u64>,
}

/// Rows of one batch grouped by storage partition.
#[derive(Debug, Default)]
pub struct RoutedBatch {
    pub rows: BTreeMap<u32, Vec<MaterializedRow>>,
    pub accepted: usize,
    pub skipped: usize,
}

/// Derive columns and group rows by partition. Skips are only counted.
pub fn route(deliveries: Vec<Delivery>) -> RoutedBatch {
    let mut routed = RoutedBatch::default();
    for delivery in deliveries {
        match delivery {
            Delivery::Row(row) => {
                let row = MaterializedRow::from_row(row);
                routed.rows.entry(row.partition_key).or_default().push(row);
                routed.accepted += 1;
            }
            Delivery::Skip { .. } => routed.skipped += 1,
        }
    }
    routed
}

#[derive(Debug)]
struct ActiveSlot {
    run: ActiveRun,
    batches: BTreeSet<u64>,
}

pub struct Materializer {
    store: Arc<PartitionedStore>,
    run_max_rows: usize,
    run_max_age: Duration,
    active: BTreeMap<u32, ActiveSlot>,
    /// Holds on each batch: active runs with its rows plus in-progress appends
    pending: HashMap<u64, usize>,
    stats: Arc<IngestStats>,
}

impl Materializer {
    pub fn new(store: Arc<PartitionedStore>, config: &IngestConfig) -> Self {
        Self {
            store,
            run_max_rows: config.run_max_rows.max(1),
            run_max_age: config.run_max_age(),
            active: BTreeMap::new(),
            pending: HashMap::new(),
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<IngestStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn store(&self) -> &Arc<PartitionedStore> {
        &self.store
    }

    /// Rows buffered in active runs, not yet durable.
    pub fn active_rows(&self) -> usize {
        self.active.values().map(|slot| slot.run.len()).sum()
    }

    pub fn active_partitions(&self) -> Vec<u32> {
        self.active.keys().copied().collect()
    }

    /// Materialize one decoded batch.
    pub async fn apply(&mut self, batch: IntakeBatch) -> Result<MaterializeResult> {
        let routed = route(batch.deliveries);
        let mut result = MaterializeResult {
            accepted: routed.accepted,
            skipped: routed.skipped,
            durable_batches: Vec::new(),
        };

        // Rows of later partitions are not appended yet; keep the batch open.
        self.hold(batch.id);
        for (partition_key, rows) in routed.rows {
            let durable = self.append(batch.id, partition_key, rows).await?;
            result.durable_batches.extend(durable);
        }
        if self.release(batch.id) {
            result.durable_batches.push(batch.id);
        }
        self.stats
            .record_batch(result.accepted + result.skipped, result.accepted, result.skipped);
        Ok(result)
    }

    /// Append already-derived rows of one partition. Returns batches that became durable.
    pub async fn append(
        &mut self,
        batch_id: u64,
        partition_key: u32,
        rows: Vec<MaterializedRow>,
    ) -> Result<Vec<u64>> {
        let max_rows = self.run_max_rows;
        let mut durable = Vec::new();
        self.hold(batch_id);
        for row in rows {
            let full = {
                let slot = self.slot(partition_key, batch_id);
                slot.run.push(row);
                slot.run.len() >= max_rows
            };
            if full {
                durable.extend(self.seal_and_write(partition_key).await?);
            }
        }
        if self.release(batch_id) {
            durable.push(batch_id);
        }
        Ok(durable)
    }

    /// Seal every active run older than `run_max_age`.
    pub async fn flush_expired(&mut self) -> Result<Vec<u64>> {
        let expired: Vec<u32> = self
            .active
            .iter()
            .filter(|(_, slot)| !slot.run.is_empty() && slot.run.age() >= self.run_max_age)
            .map(|(key, _)| *key)
            .collect();
        self.flush_partitions(expired).await
    }

    /// Seal every active run regardless of size or age.
    pub async fn flush_all(&mut self) -> Result<Vec<u64>> {
        let keys = self.active_partitions();
        self.flush_partitions(keys).await
    }

    async fn flush_partitions(&mut self, keys: Vec<u32>) -> Result<Vec<u64>> {
        let mut durable = Vec::new();
        for key in keys {
            durable.extend(self.seal_and_write(key).await?);
        }
        Ok(durable)
    }

    fn slot(&mut self, partition_key: u32, batch_id: u64) -> &mut ActiveSlot {
        let slot = self.active.entry(partition_key).or_insert_with(|| ActiveSlot {
            run: ActiveRun::new(partition_key),
            batches: BTreeSet::new(),
        });
        if slot.batches.insert(batch_id) {
            *self.pending.entry(batch_id).or_insert(0) += 1;
        }
        slot
    }

    fn hold(&mut self, batch_id: u64) {
        *self.pending.entry(batch_id).or_insert(0) += 1;
    }

    /// Drop one hold. Returns `true` when it was the last one.
    fn release(&mut self, batch_id: u64) -> bool {
        let Some(count) = self.pending.get_mut(&batch_id) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        self.pending.remove(&batch_id);
        true
    }

    async fn seal_and_write(&mut self, partition_key: u32) -> Result<Vec<u64>> {
        let Some(slot) = self.active.remove(&partition_key) else {
            return Ok(Vec::new());
        };

        let rows = slot.run.len();
        let sealed = slot.run.seal(self.store.sort_key());
        if let Err(e) = self.store.write(partition_key, sealed).await {
            tracing::error!(
                partition = partition_key,
                rows,
                batches = slot.batches.len(),
                error = %e,
                "failed to write run"
            );
            return Err(e.into());
        }
        self.stats.record_run(rows as u64);
        tracing::debug!(partition = partition_key, rows, "active run sealed");

        Ok(slot
            .batches
            .into_iter()
            .filter(|id| self.release(*id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use txhouse_core::{Row, TableSchema};

    fn row(time: &str, state: &str, amount: f64) -> Row {
        Row {
            transaction_time: time.to_string(),
            merch: "m".to_string(),
            cat_id: "gas".to_string(),
            name_1: String::new(),
            name_2: String::new(),
            gender: String::new(),
            street: String::new(),
            one_city: String::new(),
            us_state: state.to_string(),
            jobs: String::new(),
            amount,
            lat: 0.0,
            lon: 0.0,
            merchant_lat: 0.0,
            merchant_lon: 0.0,
            population_city: 0.0,
            target: None,
        }
    }

    fn batch(id: u64, deliveries: Vec<Delivery>) -> IntakeBatch {
        IntakeBatch {
            id,
            partition: 0,
            first_offset: 0,
            last_offset: deliveries.len().saturating_sub(1) as u64,
            deliveries,
        }
    }

    async fn materializer(dir: &TempDir, run_max_rows: usize) -> Materializer {
        let store = PartitionedStore::open(
            TableSchema::transactions(),
            txhouse_storage::StoreConfig::with_data_dir(dir.path()),
        )
        .await
        .unwrap();
        let config = IngestConfig {
            run_max_rows,
            ..IngestConfig::default()
        };
        Materializer::new(Arc::new(store), &config)
    }

    #[tokio::test]
    async fn test_apply_counts_and_buffers() {
        let dir = TempDir::new().unwrap();
        let mut m = materializer(&dir, 100).await;

        let result = m
            .apply(batch(
                1,
                vec![
                    Delivery::Row(row("2019-01-03 10:00:00", "CA", 1.0)),
                    Delivery::Skip {
                        offset: 1,
                        field: "amount".to_string(),
                        reason: "missing required field".to_string(),
                    },
                    Delivery::Row(row("2019-02-03 10:00:00", "NY", 2.0)),
                ],
            ))
            .await
            .unwrap();

        assert_eq!((result.accepted, result.skipped), (2, 1));
        assert!(result.durable_batches.is_empty());
        assert_eq!(m.active_rows(), 2);
        assert_eq!(m.active_partitions(), vec![201901, 201902]);

        let durable = m.flush_all().await.unwrap();
        assert_eq!(durable, vec![1]);
        assert_eq!(m.active_rows(), 0);
        assert_eq!(
            m.store().row_count(&txhouse_storage::PartitionFilter::All).await,
            2
        );
    }

    #[tokio::test]
    async fn test_batch_durable_only_when_all_partitions_written() {
        let dir = TempDir::new().unwrap();
        let mut m = materializer(&dir, 2).await;

        let result = m
            .apply(batch(
                7,
                vec![
                    Delivery::Row(row("2019-01-03 10:00:00", "CA", 1.0)),
                    Delivery::Row(row("2019-01-04 10:00:00", "CA", 2.0)),
                    Delivery::Row(row("2019-03-03 10:00:00", "TX", 3.0)),
                ],
            ))
            .await
            .unwrap();
        // January filled a run, March is still buffered.
        assert!(result.durable_batches.is_empty());
        assert_eq!(m.store().run_count(201901).await, 1);

        assert_eq!(m.flush_expired().await.unwrap(), Vec::<u64>::new());
        assert_eq!(m.flush_all().await.unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_run_sealed_mid_batch_keeps_batch_pending() {
        let dir = TempDir::new().unwrap();
        let mut m = materializer(&dir, 2).await;

        let result = m
            .apply(batch(
                4,
                vec![
                    Delivery::Row(row("2019-05-01 10:00:00", "CA", 1.0)),
                    Delivery::Row(row("2019-05-02 10:00:00", "CA", 2.0)),
                    Delivery::Row(row("2019-05-03 10:00:00", "CA", 3.0)),
                ],
            ))
            .await
            .unwrap();
        // Two rows are durable, the third is still buffered.
        assert!(result.durable_batches.is_empty());
        assert_eq!(m.store().run_count(201905).await, 1);
        assert_eq!(m.active_rows(), 1);

        assert_eq!(m.flush_all().await.unwrap(), vec![4]);
        assert_eq!(
            m.store().row_count(&txhouse_storage::PartitionFilter::All).await,
            3
        );
    }

    #[tokio::test]
    async fn test_append_reports_batch_after_its_last_row() {
        let dir = TempDir::new().unwrap();
        let mut m = materializer(&dir, 2).await;
        let rows: Vec<MaterializedRow> = (0..4)
            .map(|i| MaterializedRow::from_row(row("2019-06-01 10:00:00", "NY", i as f64)))
            .collect();

        // Exactly two full runs: durable once the append returns.
        assert_eq!(m.append(9, 201906, rows[..2].to_vec()).await.unwrap(), vec![9]);
        assert_eq!(m.append(10, 201906, rows[2..3].to_vec()).await.unwrap(), Vec::<u64>::new());
        // Batch 11 fills the run batch 10 started, then buffers one more row.
        let durable = m
            .append(11, 201906, vec![rows[3].clone(), rows[0].clone()])
            .await
            .unwrap();
        assert_eq!(durable, vec![10]);
        assert_eq!(m.active_rows(), 1);
        assert_eq!(m.flush_all().await.unwrap(), vec![11]);
    }

    #[tokio::test]
    async fn test_all_skipped_batch_is_durable_immediately() {
        let dir = TempDir::new().unwrap();
        let mut m = materializer(&dir, 10).await;

        let result = m
            .apply(batch(
                3,
                vec![Delivery::Skip {
                    offset: 0,
                    field: "<message>".to_string(),
                    reason: "expected value".to_string(),
                }],
            ))
            .await
            .unwrap();
        assert_eq!(result.durable_batches, vec![3]);
        assert_eq!(result.skipped, 1);
    }

    #[tokio::test]
    async fn test_unparseable_time_goes_to_epoch_partition() {
        let dir = TempDir::new().unwrap();
        let mut m = materializer(&dir, 1).await;
        m.apply(batch(1, vec![Delivery::Row(row("yesterday-ish", "CA", 1.0))]))
            .await
            .unwrap();
        assert_eq!(m.store().partition_keys().await, vec![197001]);
    }
}
