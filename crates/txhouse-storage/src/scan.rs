//! Scans
//!
//! A [`ScanRequest`] narrows a read three ways, cheapest first:
//!
//! 1. **Partition filter**: partitions outside it are never looked at.
//! 2. **Run pruning**: a run is skipped when the key prefix falls outside its
//!    leading-key min/max, or when its skip index proves a column predicate cannot match.
//! 3. **Row filter**: surviving runs are merged and each row is checked against the
//!    key prefix and column predicates.
//!
//! [`RowScan`] is lazy. All surviving runs of all surviving partitions feed one merge,
//! so rows come out in ordering-key order across partitions, with equal keys ordered
//! by partition key and then `seq`. Run files are read on the first `next` and each
//! one is decoded a row group at a time. Every run the scan may read is pinned when
//! the scan starts, so concurrent compaction or drops never change what an in-flight
//! scan returns.

use crate::error::Result;
use crate::merge::MergeIterator;
use crate::partition::RunHandle;
use crate::skip_index::SkipIndexStats;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use txhouse_core::{Column, MaterializedRow, SortKey, Value};

/// Rows between cooperative yields to the runtime.
const YIELD_EVERY: u32 = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionFilter {
    #[default]
    All,
    Eq(u32),
    /// Inclusive range of `YYYYMM` keys
    Range { from: u32, to: u32 },
    In(Vec<u32>),
}

impl PartitionFilter {
    pub fn matches(&self, key: u32) -> bool {
        match self {
            PartitionFilter::All => true,
            PartitionFilter::Eq(k) => *k == key,
            PartitionFilter::Range { from, to } => (*from..=*to).contains(&key),
            PartitionFilter::In(keys) => keys.contains(&key),
        }
    }
}

/// Equality on the leading ordering-key columns, e.g. `us_state = 'CA'` or
/// `(us_state, cat_id) = ('CA', 'gas_transport')`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyPrefix(pub Vec<Value>);

/// `column IN (values)`; a single value is plain equality.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnPredicate {
    pub column: Column,
    pub values: Vec<Value>,
}

impl ColumnPredicate {
    pub fn eq(column: Column, value: impl Into<Value>) -> Self {
        Self {
            column,
            values: vec![value.into()],
        }
    }

    pub fn in_list(column: Column, values: Vec<Value>) -> Self {
        Self { column, values }
    }

    pub fn matches(&self, row: &MaterializedRow) -> bool {
        let actual = row.get(self.column);
        self.values.iter().any(|v| v.as_ref() == actual)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanRequest {
    pub partitions: PartitionFilter,
    pub key_prefix: KeyPrefix,
    pub predicates: Vec<ColumnPredicate>,
}

impl ScanRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn partitions(mut self, filter: PartitionFilter) -> Self {
        self.partitions = filter;
        self
    }

    pub fn key_prefix(mut self, values: Vec<Value>) -> Self {
        self.key_prefix = KeyPrefix(values);
        self
    }

    pub fn predicate(mut self, predicate: ColumnPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }
}

/// Row-level filter compiled from a request against a table's ordering key.
#[derive(Debug, Clone)]
pub(crate) struct RowFilter {
    prefix: Vec<(Column, Value)>,
    predicates: Vec<ColumnPredicate>,
}

impl RowFilter {
    pub fn new(request: &ScanRequest, sort_key: &SortKey) -> Self {
        let prefix = sort_key
            .columns
            .iter()
            .zip(request.key_prefix.0.iter())
            .map(|(sort, value)| (sort.column, value.clone()))
            .collect();
        Self {
            prefix,
            predicates: request.predicates.clone(),
        }
    }

    pub fn matches(&self, row: &MaterializedRow) -> bool {
        self.prefix
            .iter()
            .all(|(column, value)| row.get(*column) == value.as_ref())
            && self.predicates.iter().all(|p| p.matches(row))
    }

    /// Whether a run may hold matching rows, judged from metadata and skip index.
    pub fn may_match_run(&self, run: &RunHandle, stats: &SkipIndexStats) -> bool {
        if let Some((_, leading)) = self.prefix.first() {
            if let (Some(min), Some(max)) = (&run.meta.key_min, &run.meta.key_max) {
                if leading < min || leading > max {
                    return false;
                }
            }
        }
        self.predicates
            .iter()
            .all(|p| run.index.may_match(p.column, &p.values, stats))
    }
}

/// Lazy, ordered stream of rows produced by [`PartitionedStore::scan`](crate::PartitionedStore::scan).
pub struct RowScan {
    runs: Vec<Arc<RunHandle>>,
    merge: Option<MergeIterator>,
    filter: RowFilter,
    sort_key: Arc<SortKey>,
    since_yield: u32,
    rows_examined: u64,
}

impl RowScan {
    pub(crate) fn new(
        runs: Vec<Arc<RunHandle>>,
        filter: RowFilter,
        sort_key: Arc<SortKey>,
    ) -> Self {
        Self {
            runs,
            merge: None,
            filter,
            sort_key,
            since_yield: 0,
            rows_examined: 0,
        }
    }

    /// Number of runs not opened yet.
    pub fn pending_runs(&self) -> usize {
        if self.merge.is_some() {
            0
        } else {
            self.runs.len()
        }
    }

    /// Rows read from runs so far, matched or not.
    pub fn rows_examined(&self) -> u64 {
        self.rows_examined
    }

    pub async fn next(&mut self) -> Result<Option<MaterializedRow>> {
        if self.merge.is_none() {
            let mut readers = Vec::with_capacity(self.runs.len());
            for run in &self.runs {
                readers.push(run.reader().await?);
            }
            tracing::trace!(runs = readers.len(), "scan opened runs");
            self.merge = Some(MergeIterator::from_readers(self.sort_key.clone(), readers));
        }
        let Some(merge) = self.merge.as_mut() else {
            return Ok(None);
        };

        for row in merge.by_ref() {
            let row = row?;
            self.rows_examined += 1;
            self.since_yield += 1;
            if self.since_yield >= YIELD_EVERY {
                self.since_yield = 0;
                tokio::task::yield_now().await;
            }
            if self.filter.matches(&row) {
                return Ok(Some(row));
            }
        }
        Ok(None)
    }

    pub async fn collect(mut self) -> Result<Vec<MaterializedRow>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_filter() {
        assert!(PartitionFilter::All.matches(201901));
        assert!(PartitionFilter::Eq(201901).matches(201901));
        assert!(!PartitionFilter::Eq(201901).matches(201902));
        let range = PartitionFilter::Range {
            from: 201901,
            to: 201903,
        };
        assert!(range.matches(201903));
        assert!(!range.matches(201904));
        assert!(PartitionFilter::In(vec![201905, 201907]).matches(201907));
    }

    #[test]
    fn test_partition_filter_serde() {
        let filter: PartitionFilter = serde_json::from_str(r#"{"eq":201901}"#).unwrap();
        assert_eq!(filter, PartitionFilter::Eq(201901));
        let filter: PartitionFilter = serde_json::from_str(r#""all""#).unwrap();
        assert_eq!(filter, PartitionFilter::All);
    }
}
