//! K-way merge of sorted row streams.
//!
//! Each source is already sorted by the table's ordering key. The merge keeps one
//! head row per source in a binary heap and yields rows in ordering-key order. Rows
//! with equal keys come out by partition key and then `seq`, so older rows stay ahead
//! of newer ones no matter which run holds them. Sources may come from different
//! partitions. Nothing is deduplicated: the output holds exactly the input multiset.
//!
//! A source that fails hands its error to the caller and is dropped from the merge.

use crate::error::{Error, Result};
use crate::run::format::RunReader;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use txhouse_core::{MaterializedRow, SortKey};

pub type RowIter = Box<dyn Iterator<Item = Result<MaterializedRow>> + Send>;

struct HeapEntry {
    row: MaterializedRow,
    source: usize,
    iterator: RowIter,
    key: Arc<SortKey>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    // BinaryHeap is a max-heap, so the smallest row must compare greatest.
    // `seq` is only unique within a partition.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .compare_keys(&self.row, &other.row)
            .then_with(|| self.row.partition_key.cmp(&other.row.partition_key))
            .then_with(|| self.row.seq.cmp(&other.row.seq))
            .then_with(|| self.source.cmp(&other.source))
            .reverse()
    }
}

pub struct MergeIterator {
    heap: BinaryHeap<HeapEntry>,
    errors: Vec<Error>,
}

impl MergeIterator {
    pub fn new(key: Arc<SortKey>, sources: Vec<RowIter>) -> Self {
        let mut merge = Self {
            heap: BinaryHeap::with_capacity(sources.len()),
            errors: Vec::new(),
        };
        for (source, iterator) in sources.into_iter().enumerate() {
            merge.advance(key.clone(), source, iterator);
        }
        merge
    }

    pub fn from_runs(key: Arc<SortKey>, runs: Vec<Vec<MaterializedRow>>) -> Self {
        let sources = runs
            .into_iter()
            .map(|rows| Box::new(rows.into_iter().map(Ok)) as RowIter)
            .collect();
        Self::new(key, sources)
    }

    /// Merge run files, decoding each one a row group at a time.
    pub fn from_readers(key: Arc<SortKey>, readers: Vec<RunReader>) -> Self {
        let sources = readers
            .into_iter()
            .map(|reader| {
                Box::new(reader.into_rows().map(|row| row.map_err(Error::from))) as RowIter
            })
            .collect();
        Self::new(key, sources)
    }

    fn advance(&mut self, key: Arc<SortKey>, source: usize, mut iterator: RowIter) {
        match iterator.next() {
            Some(Ok(row)) => self.heap.push(HeapEntry {
                row,
                source,
                iterator,
                key,
            }),
            Some(Err(e)) => self.errors.push(e),
            None => {}
        }
    }
}

impl Iterator for MergeIterator {
    type Item = Result<MaterializedRow>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.errors.pop() {
            return Some(Err(e));
        }
        let HeapEntry {
            row,
            source,
            iterator,
            key,
        } = self.heap.pop()?;

        self.advance(key, source, iterator);
        Some(Ok(row))
    }
}

impl std::fmt::Debug for MergeIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeIterator")
            .field("sources", &self.heap.len())
            .field("errors", &self.errors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use txhouse_core::{Row, TableSchema};

    fn merged(merge: MergeIterator) -> Vec<MaterializedRow> {
        merge.collect::<Result<Vec<_>>>().unwrap()
    }

    fn row(state: &str, amount: f64, seq: u64) -> MaterializedRow {
        let mut row = MaterializedRow::from_row(Row {
            transaction_time: "2019-01-01 00:00:00".to_string(),
            merch: String::new(),
            cat_id: "c".to_string(),
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
        });
        row.seq = seq;
        row
    }

    #[test]
    fn test_merge_interleaves_and_keeps_duplicates() {
        let key = Arc::new(TableSchema::transactions().order_by);
        let runs = vec![
            vec![row("AL", 9.0, 0), row("CA", 5.0, 1), row("WY", 1.0, 2)],
            vec![row("CA", 5.0, 3), row("NY", 2.0, 4)],
            vec![],
            vec![row("AL", 10.0, 5)],
        ];
        let rows: Vec<(String, f64, u64)> = merged(MergeIterator::from_runs(key, runs))
            .into_iter()
            .map(|r| (r.row.us_state, r.row.amount, r.seq))
            .collect();

        assert_eq!(
            rows,
            vec![
                ("AL".to_string(), 10.0, 5),
                ("AL".to_string(), 9.0, 0),
                ("CA".to_string(), 5.0, 1),
                ("CA".to_string(), 5.0, 3),
                ("NY".to_string(), 2.0, 4),
                ("WY".to_string(), 1.0, 2),
            ]
        );
    }

    #[test]
    fn test_equal_keys_ordered_by_seq_across_sources() {
        let key = Arc::new(TableSchema::transactions().order_by);
        // Newer run listed first; seq still decides.
        let runs = vec![vec![row("CA", 1.0, 7)], vec![row("CA", 1.0, 2)]];
        let seqs: Vec<u64> = merged(MergeIterator::from_runs(key, runs))
            .iter()
            .map(|r| r.seq)
            .collect();
        assert_eq!(seqs, vec![2, 7]);
    }

    #[test]
    fn test_runs_of_different_partitions_merge_by_key() {
        let key = Arc::new(TableSchema::transactions().order_by);
        let in_partition = |mut row: MaterializedRow, partition_key: u32| {
            row.partition_key = partition_key;
            row
        };
        let runs = vec![
            vec![
                in_partition(row("CA", 5.0, 0), 201902),
                in_partition(row("NY", 3.0, 1), 201902),
            ],
            vec![
                in_partition(row("CA", 5.0, 4), 201901),
                in_partition(row("NY", 1.0, 0), 201901),
            ],
        ];
        let rows: Vec<(String, u32, u64)> = merged(MergeIterator::from_runs(key, runs))
            .into_iter()
            .map(|r| (r.row.us_state, r.partition_key, r.seq))
            .collect();

        // Equal keys: lower partition first even though its seq is larger.
        assert_eq!(
            rows,
            vec![
                ("CA".to_string(), 201901, 4),
                ("CA".to_string(), 201902, 0),
                ("NY".to_string(), 201902, 1),
                ("NY".to_string(), 201901, 0),
            ]
        );
    }

    #[test]
    fn test_failing_source_surfaces_error() {
        let key = Arc::new(TableSchema::transactions().order_by);
        let failing: RowIter = Box::new(
            vec![
                Ok(row("AL", 1.0, 0)),
                Err(Error::Format(txhouse_core::Error::InvalidMagic)),
            ]
            .into_iter(),
        );
        let healthy: RowIter = Box::new(vec![Ok(row("CA", 1.0, 1))].into_iter());
        let results: Vec<Result<MaterializedRow>> =
            MergeIterator::new(key, vec![failing, healthy]).collect();

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results.iter().any(|r| r.is_err()));
    }

    #[test]
    fn test_no_sources() {
        let key = Arc::new(TableSchema::transactions().order_by);
        assert!(merged(MergeIterator::from_runs(key, Vec::new())).is_empty());
    }
}
