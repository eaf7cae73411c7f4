//! Partitioned Columnar Store
//!
//! One store holds one table. Rows are bucketed by `partition_key` (`YYYYMM`); each
//! partition is an independent set of immutable sorted runs with its own manifest,
//! write lock and compaction.
//!
//! ## Write path
//!
//! ```text
//! write(key, SortedRun)
//!   ├─ lock partition writer           (other partitions unaffected)
//!   ├─ rebase ordinals onto next_seq
//!   ├─ encode run + build skip index
//!   ├─ run-<id>.run, run-<id>.idx      temp file → fsync → rename
//!   └─ MANIFEST.json                   temp file → fsync → rename, then swap snapshot
//! ```
//!
//! A run is visible to scans only after its manifest entry is durable. A crash in the
//! middle leaves at most unreferenced files, which [`PartitionedStore::open`] deletes.
//!
//! ## Compaction
//!
//! `compact` merges a partition's runs into one. The merge runs against a snapshot
//! without blocking writers; installing the result re-checks that every input is still
//! live. If not (a concurrent compaction or drop won), the output is discarded and
//! the whole pass retried, up to `max_conflict_retries` times.
//!
//! ## Concurrency
//!
//! The partition map is a `RwLock<BTreeMap>` held only for lookup and insert. Run
//! ids come from one store-wide counter so a dropped and recreated partition can never
//! reuse a file name still pinned by an old snapshot.

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::merge::MergeIterator;
use crate::partition::{write_atomic, Manifest, Partition, RunHandle, RunSet, MANIFEST_FILE};
use crate::run::format::{decode_run, encode_run};
use crate::run::{parse_run_id, RunMeta, SortedRun};
use crate::scan::{PartitionFilter, RowFilter, RowScan, ScanRequest};
use crate::skip_index::{SkipIndex, SkipIndexStats};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use txhouse_core::{MaterializedRow, SortKey, TableSchema, Value};

/// Summary of one partition for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub partition_key: u32,
    pub runs: usize,
    pub rows: u64,
    pub bytes: u64,
}

/// Result of a successful compaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionOutcome {
    pub partition_key: u32,
    pub runs_merged: usize,
    pub rows: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
    pub output_run: u64,
    pub attempts: u32,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

struct PreparedCompaction {
    inputs: Vec<u64>,
    bytes_before: u64,
    output: Arc<RunHandle>,
}

pub struct PartitionedStore {
    schema: Arc<TableSchema>,
    sort_key: Arc<SortKey>,
    config: StoreConfig,
    root: PathBuf,
    partitions: RwLock<BTreeMap<u32, Arc<Partition>>>,
    next_run_id: AtomicU64,
    index_stats: Arc<SkipIndexStats>,
}

impl std::fmt::Debug for PartitionedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionedStore")
            .field("table", &self.schema.name)
            .field("root", &self.root)
            .finish()
    }
}

impl PartitionedStore {
    /// Open (or create) the table directory under `config.data_dir`, recovering every
    /// partition from its manifest.
    #[tracing::instrument(skip(schema, config), fields(table = %schema.name))]
    pub async fn open(schema: TableSchema, config: StoreConfig) -> Result<Self> {
        schema.validate()?;
        let root = config.data_dir.join(&schema.name);
        tokio::fs::create_dir_all(&root).await?;

        let mut partitions = BTreeMap::new();
        let mut max_run_id = 0u64;
        let mut orphans = 0usize;

        let mut entries = tokio::fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(key) = parse_partition_dir(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let dir = entry.path();
            let files = list_files(&dir).await?;
            for name in &files {
                if let Some(id) = parse_run_id(name) {
                    max_run_id = max_run_id.max(id);
                }
            }

            let Some(manifest) = Manifest::load(&dir).await? else {
                // Dropped, or never got its first run durable.
                tracing::debug!(partition = key, "removing partition directory without manifest");
                tokio::fs::remove_dir_all(&dir).await?;
                continue;
            };

            let live: HashSet<u64> = manifest.runs.iter().map(|r| r.id).collect();
            for name in &files {
                let referenced = parse_run_id(name).is_some_and(|id| live.contains(&id));
                if name != MANIFEST_FILE && !referenced {
                    tokio::fs::remove_file(dir.join(name)).await?;
                    orphans += 1;
                }
            }

            let mut runs = Vec::with_capacity(manifest.runs.len());
            for meta in manifest.runs {
                max_run_id = max_run_id.max(meta.id);
                let index = load_or_rebuild_index(&dir, &meta, &schema, config.fsync).await?;
                runs.push(Arc::new(RunHandle::new(&dir, meta, index)));
            }
            partitions.insert(
                key,
                Arc::new(Partition::new(key, dir, manifest.next_seq, runs)),
            );
        }

        tracing::info!(
            partitions = partitions.len(),
            orphans_removed = orphans,
            "opened partitioned store"
        );

        Ok(Self {
            sort_key: Arc::new(schema.order_by.clone()),
            schema: Arc::new(schema),
            config,
            root,
            partitions: RwLock::new(partitions),
            next_run_id: AtomicU64::new(max_run_id + 1),
            index_stats: Arc::new(SkipIndexStats::default()),
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn sort_key(&self) -> &SortKey {
        &self.sort_key
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn index_stats(&self) -> &SkipIndexStats {
        &self.index_stats
    }

    async fn partition(&self, key: u32) -> Option<Arc<Partition>> {
        self.partitions.read().await.get(&key).cloned()
    }

    async fn get_or_create_partition(&self, key: u32) -> Result<Arc<Partition>> {
        // Fast path: read lock
        if let Some(partition) = self.partition(key).await {
            return Ok(partition);
        }

        let mut partitions = self.partitions.write().await;
        // Double-check after acquiring write lock
        if let Some(partition) = partitions.get(&key) {
            return Ok(partition.clone());
        }

        let dir = self.root.join(partition_dir_name(key));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::write_failure(key, e))?;
        let partition = Arc::new(Partition::new(key, dir, 0, Vec::new()));
        partitions.insert(key, partition.clone());
        tracing::debug!(partition = key, "created partition");
        Ok(partition)
    }

    /// Make a sealed run durable and visible. Returns `None` for an empty run.
    #[tracing::instrument(skip(self, run), fields(table = %self.schema.name, rows = run.len()))]
    pub async fn write(&self, partition_key: u32, mut run: SortedRun) -> Result<Option<RunMeta>> {
        if run.is_empty() {
            return Ok(None);
        }
        if run.partition_key() != partition_key {
            return Err(Error::PartitionMismatch {
                expected: partition_key,
                found: run.partition_key(),
            });
        }
        if let Some(row) = run.rows().iter().find(|r| r.partition_key != partition_key) {
            return Err(Error::PartitionMismatch {
                expected: partition_key,
                found: row.partition_key,
            });
        }

        loop {
            let partition = self.get_or_create_partition(partition_key).await?;
            let mut state = partition.writer().lock().await;
            if partition.is_dropped() {
                // Lost a race with drop_partition; the next lookup creates a fresh one.
                drop(state);
                self.forget_dropped(partition_key, &partition).await;
                continue;
            }

            let base = state.next_seq;
            for row in run.rows_mut() {
                row.seq += base;
            }
            let handle = self.persist_run(&partition, &run).await?;
            state.next_seq = handle.meta.max_seq + 1;

            let mut runs = partition.snapshot().runs.clone();
            runs.push(handle.clone());
            if let Err(e) = partition.install(&state, runs, self.config.fsync).await {
                handle.retire();
                return Err(e);
            }

            tracing::info!(
                partition = partition_key,
                run = handle.meta.id,
                rows = handle.meta.rows,
                bytes = handle.meta.bytes,
                "run written"
            );
            return Ok(Some(handle.meta.clone()));
        }
    }

    async fn forget_dropped(&self, key: u32, stale: &Arc<Partition>) {
        let mut partitions = self.partitions.write().await;
        if partitions.get(&key).is_some_and(|p| Arc::ptr_eq(p, stale)) {
            partitions.remove(&key);
        }
    }

    /// Encode and durably write a run's files. The run is not yet in any manifest.
    async fn persist_run(&self, partition: &Partition, run: &SortedRun) -> Result<Arc<RunHandle>> {
        let key = partition.key();
        let id = self.next_run_id.fetch_add(1, Ordering::SeqCst);
        let bytes = encode_run(run, self.config.compression)?;
        let index = SkipIndex::build(run.rows(), &self.schema.skip_indexes);

        let (key_min, key_max) = leading_bounds(&self.sort_key, run.rows());
        let meta = RunMeta {
            id,
            partition_key: key,
            rows: run.len() as u64,
            bytes: bytes.len() as u64,
            min_seq: run.rows().iter().map(|r| r.seq).min().unwrap_or(0),
            max_seq: run.rows().iter().map(|r| r.seq).max().unwrap_or(0),
            key_min,
            key_max,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        };

        let handle = Arc::new(RunHandle::new(partition.dir(), meta, index));
        let write = async {
            // A dropped partition's directory may have been removed underneath us.
            tokio::fs::create_dir_all(partition.dir()).await?;
            write_atomic(handle.path(), &bytes, self.config.fsync).await?;
            write_atomic(
                &partition.dir().join(handle.meta.index_file_name()),
                &handle.index.to_bytes(),
                self.config.fsync,
            )
            .await
        };
        if let Err(e) = write.await {
            handle.retire();
            return Err(Error::write_failure(key, e));
        }
        Ok(handle)
    }

    /// Start a lazy, ordered scan. Runs are pinned now; files are read on the first
    /// `next` and decoded as the scan advances.
    pub async fn scan(&self, request: ScanRequest) -> Result<RowScan> {
        let filter = RowFilter::new(&request, &self.sort_key);
        let partitions: Vec<Arc<Partition>> = self
            .partitions
            .read()
            .await
            .iter()
            .filter(|(key, _)| request.partitions.matches(**key))
            .map(|(_, p)| p.clone())
            .collect();

        let mut pending = Vec::new();
        let mut scanned_partitions = 0usize;
        let mut pruned = 0usize;
        for partition in partitions {
            let snapshot = partition.snapshot();
            let runs: Vec<Arc<RunHandle>> = snapshot
                .runs
                .iter()
                .filter(|run| {
                    let keep = filter.may_match_run(run, &self.index_stats);
                    if !keep {
                        pruned += 1;
                    }
                    keep
                })
                .cloned()
                .collect();
            if !runs.is_empty() {
                scanned_partitions += 1;
                pending.extend(runs);
            }
        }

        tracing::debug!(
            partitions = scanned_partitions,
            runs = pending.len(),
            runs_pruned = pruned,
            "scan planned"
        );
        Ok(RowScan::new(pending, filter, self.sort_key.clone()))
    }

    /// Merge a partition's runs into one. `Ok(None)` when there is nothing to merge.
    #[tracing::instrument(skip(self), fields(table = %self.schema.name))]
    pub async fn compact(&self, partition_key: u32) -> Result<Option<CompactionOutcome>> {
        let started = Instant::now();
        let max_attempts = self.config.max_conflict_retries + 1;

        for attempt in 1..=max_attempts {
            let Some(partition) = self.partition(partition_key).await else {
                if attempt == 1 {
                    return Err(Error::PartitionNotFound(partition_key));
                }
                return Ok(None);
            };

            let snapshot = partition.snapshot();
            let Some(prepared) = self.prepare_compaction(&partition, &snapshot).await? else {
                return Ok(None);
            };

            match self.install_compaction(&partition, &prepared).await {
                Ok(()) => {
                    let outcome = CompactionOutcome {
                        partition_key,
                        runs_merged: prepared.inputs.len(),
                        rows: prepared.output.meta.rows,
                        bytes_before: prepared.bytes_before,
                        bytes_after: prepared.output.meta.bytes,
                        output_run: prepared.output.meta.id,
                        attempts: attempt,
                        duration: started.elapsed(),
                    };
                    tracing::info!(
                        partition = partition_key,
                        runs_merged = outcome.runs_merged,
                        rows = outcome.rows,
                        bytes_before = outcome.bytes_before,
                        bytes_after = outcome.bytes_after,
                        "compaction complete"
                    );
                    return Ok(Some(outcome));
                }
                Err(Error::CompactionConflict { .. }) => {
                    prepared.output.retire();
                    tracing::debug!(partition = partition_key, attempt, "compaction conflict, retrying");
                }
                Err(e) => {
                    prepared.output.retire();
                    return Err(e);
                }
            }
        }

        tracing::warn!(
            partition = partition_key,
            attempts = max_attempts,
            "compaction abandoned after repeated conflicts"
        );
        Ok(None)
    }

    async fn prepare_compaction(
        &self,
        partition: &Partition,
        snapshot: &RunSet,
    ) -> Result<Option<PreparedCompaction>> {
        let limit = self.config.max_runs_per_compaction.max(2);
        let inputs: Vec<&Arc<RunHandle>> = snapshot.runs.iter().take(limit).collect();
        if inputs.len() < 2 {
            return Ok(None);
        }

        let mut readers = Vec::with_capacity(inputs.len());
        for run in &inputs {
            readers.push(run.reader().await?);
        }
        let rows = MergeIterator::from_readers(self.sort_key.clone(), readers)
            .collect::<Result<Vec<MaterializedRow>>>()?;
        let merged = SortedRun::presorted(partition.key(), rows);
        let output = self.persist_run(partition, &merged).await?;

        Ok(Some(PreparedCompaction {
            inputs: inputs.iter().map(|r| r.meta.id).collect(),
            bytes_before: inputs.iter().map(|r| r.meta.bytes).sum(),
            output,
        }))
    }

    async fn install_compaction(
        &self,
        partition: &Partition,
        prepared: &PreparedCompaction,
    ) -> Result<()> {
        let state = partition.writer().lock().await;
        let current = partition.snapshot();
        if partition.is_dropped() || !prepared.inputs.iter().all(|id| current.contains(*id)) {
            return Err(Error::CompactionConflict {
                partition: partition.key(),
            });
        }

        // The merged run takes the place of the oldest input.
        let mut runs = Vec::with_capacity(current.runs.len() + 1 - prepared.inputs.len());
        let mut placed = false;
        for run in &current.runs {
            if prepared.inputs.contains(&run.meta.id) {
                if !placed {
                    runs.push(prepared.output.clone());
                    placed = true;
                }
            } else {
                runs.push(run.clone());
            }
        }
        partition.install(&state, runs, self.config.fsync).await?;

        for run in current.runs.iter().filter(|r| prepared.inputs.contains(&r.meta.id)) {
            run.retire();
        }
        Ok(())
    }

    /// Remove a partition with all its runs and skip indexes. Irreversible.
    /// Returns `false` when the partition did not exist.
    #[tracing::instrument(skip(self), fields(table = %self.schema.name))]
    pub async fn drop_partition(&self, partition_key: u32) -> Result<bool> {
        let Some(partition) = self.partitions.write().await.remove(&partition_key) else {
            return Ok(false);
        };

        let _state = partition.writer().lock().await;
        partition.mark_dropped();
        let previous = partition.clear();
        match tokio::fs::remove_file(partition.dir().join(MANIFEST_FILE)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for run in &previous.runs {
            run.retire();
        }
        let (runs, rows) = (previous.runs.len(), previous.rows());
        drop(previous);
        // Empty when no scan pins the old runs; otherwise the last handle cleans up.
        let _ = tokio::fs::remove_dir(partition.dir()).await;

        tracing::info!(partition = partition_key, runs, rows, "partition dropped");
        Ok(true)
    }

    /// Drop every partition. Used when the table itself is dropped.
    pub async fn drop_all(&self) -> Result<usize> {
        let keys = self.partition_keys().await;
        let mut dropped = 0;
        for key in keys {
            if self.drop_partition(key).await? {
                dropped += 1;
            }
        }
        Ok(dropped)
    }

    pub async fn partition_keys(&self) -> Vec<u32> {
        self.partitions.read().await.keys().copied().collect()
    }

    pub async fn list_partitions(&self) -> Vec<PartitionInfo> {
        self.partitions
            .read()
            .await
            .values()
            .map(|p| {
                let snapshot = p.snapshot();
                PartitionInfo {
                    partition_key: p.key(),
                    runs: snapshot.runs.len(),
                    rows: snapshot.rows(),
                    bytes: snapshot.bytes(),
                }
            })
            .filter(|info| info.runs > 0)
            .collect()
    }

    /// Row count from manifests; never opens run files.
    pub async fn row_count(&self, filter: &PartitionFilter) -> u64 {
        self.partitions
            .read()
            .await
            .iter()
            .filter(|(key, _)| filter.matches(**key))
            .map(|(_, p)| p.snapshot().rows())
            .sum()
    }

    /// Number of live runs in a partition (0 when absent).
    pub async fn run_count(&self, partition_key: u32) -> usize {
        match self.partition(partition_key).await {
            Some(p) => p.snapshot().runs.len(),
            None => 0,
        }
    }
}

fn partition_dir_name(key: u32) -> String {
    format!("p{}", key)
}

fn parse_partition_dir(name: &str) -> Option<u32> {
    name.strip_prefix('p')?.parse().ok()
}

async fn list_files(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

fn leading_bounds(sort_key: &SortKey, rows: &[MaterializedRow]) -> (Option<Value>, Option<Value>) {
    let Some(leading) = sort_key.leading() else {
        return (None, None);
    };
    let values = rows.iter().map(|r| r.get(leading.column));
    let min = values.clone().min().map(|v| v.to_owned_value());
    let max = values.max().map(|v| v.to_owned_value());
    (min, max)
}

/// Read a run's skip-index sidecar, rebuilding it from the run file when it is
/// missing, corrupt or out of date with the schema.
async fn load_or_rebuild_index(
    dir: &Path,
    meta: &RunMeta,
    schema: &TableSchema,
    fsync: bool,
) -> Result<SkipIndex> {
    let path = dir.join(meta.index_file_name());
    match tokio::fs::read(&path).await {
        Ok(bytes) => match SkipIndex::from_bytes(&bytes) {
            Ok(index) if index.matches(&schema.skip_indexes) => return Ok(index),
            Ok(_) => tracing::debug!(run = meta.id, "skip index columns changed, rebuilding"),
            Err(e) => tracing::warn!(run = meta.id, error = %e, "corrupt skip index, rebuilding"),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(run = meta.id, "missing skip index, rebuilding");
        }
        Err(e) => return Err(e.into()),
    }

    let run = decode_run(&tokio::fs::read(dir.join(meta.file_name())).await?)?;
    let index = SkipIndex::build(run.rows(), &schema.skip_indexes);
    write_atomic(&path, &index.to_bytes(), fsync).await?;
    Ok(index)
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
