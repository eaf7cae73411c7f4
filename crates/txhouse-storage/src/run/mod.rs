//! Runs
//!
//! A partition is a set of immutable sorted runs. Rows reach a run in two steps:
//!
//! ```text
//! ActiveRun (mutable, insertion order)
//!     │ seal(): stable sort by ordering key
//!     ▼
//! SortedRun (immutable, in memory)
//!     │ PartitionedStore::write(): assign seq, encode, fsync, rename
//!     ▼
//! run-<id>.run + run-<id>.idx, listed in the partition manifest as a RunMeta
//! ```
//!
//! Before a run is written, each row's `seq` holds its ordinal inside the active run.
//! The store rebases those ordinals onto the partition's sequence counter, so equal
//! keys keep insertion order both inside a run and across runs.

pub mod format;

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use txhouse_core::{MaterializedRow, SortKey, Value};

/// Mutable buffer of rows for one partition, in arrival order.
#[derive(Debug)]
pub struct ActiveRun {
    partition_key: u32,
    rows: Vec<MaterializedRow>,
    opened_at: Instant,
}

impl ActiveRun {
    pub fn new(partition_key: u32) -> Self {
        Self {
            partition_key,
            rows: Vec::new(),
            opened_at: Instant::now(),
        }
    }

    pub fn partition_key(&self) -> u32 {
        self.partition_key
    }

    pub fn push(&mut self, mut row: MaterializedRow) {
        row.seq = self.rows.len() as u64;
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn seal(self, sort_key: &SortKey) -> SortedRun {
        SortedRun::from_rows(self.partition_key, self.rows, sort_key)
    }
}

/// Immutable batch of rows sorted by the ordering key.
#[derive(Debug, Clone)]
pub struct SortedRun {
    partition_key: u32,
    rows: Vec<MaterializedRow>,
}

impl SortedRun {
    pub fn from_rows(partition_key: u32, mut rows: Vec<MaterializedRow>, sort_key: &SortKey) -> Self {
        rows.sort_by(|a, b| sort_key.compare(a, b));
        Self {
            partition_key,
            rows,
        }
    }

    /// Wrap rows that are already in ordering-key order (merge output, decoded files).
    pub(crate) fn presorted(partition_key: u32, rows: Vec<MaterializedRow>) -> Self {
        Self {
            partition_key,
            rows,
        }
    }

    pub fn partition_key(&self) -> u32 {
        self.partition_key
    }

    pub fn rows(&self) -> &[MaterializedRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<MaterializedRow> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn rows_mut(&mut self) -> &mut [MaterializedRow] {
        &mut self.rows
    }
}

/// Manifest entry for a durable run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub id: u64,
    pub partition_key: u32,
    pub rows: u64,
    /// Size of the run file in bytes
    pub bytes: u64,
    pub min_seq: u64,
    pub max_seq: u64,
    /// Smallest and largest value of the leading ordering-key column
    pub key_min: Option<Value>,
    pub key_max: Option<Value>,
    pub created_at_ms: i64,
}

impl RunMeta {
    pub fn file_name(&self) -> String {
        run_file_name(self.id)
    }

    pub fn index_file_name(&self) -> String {
        index_file_name(self.id)
    }
}

pub fn run_file_name(id: u64) -> String {
    format!("run-{:012}.run", id)
}

pub fn index_file_name(id: u64) -> String {
    format!("run-{:012}.idx", id)
}

/// Run id encoded in a `run-<id>.run` or `run-<id>.idx` file name.
pub fn parse_run_id(file_name: &str) -> Option<u64> {
    let stem = file_name
        .strip_prefix("run-")?
        .strip_suffix(".run")
        .or_else(|| file_name.strip_prefix("run-")?.strip_suffix(".idx"))?;
    stem.parse().ok()
}
