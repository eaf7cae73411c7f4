//! Table Schema
//!
//! The schema is the declarative description of a table: which columns it stores, the
//! ordering key every sorted run follows, and which columns get a skip index.
//!
//! ```text
//! transactions
//!   ORDER BY   (us_state ASC, cat_id ASC, amount DESC)
//!   PARTITION  toYYYYMM(transaction_date)
//!   SKIP INDEX us_state bloom(0.01), cat_id bloom(0.01)
//! ```
//!
//! Partitioning is always by the derived `partition_key`, so it is not configurable.

use crate::column::Column;
use crate::error::{Error, Result};
use crate::row::MaterializedRow;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

pub const TRANSACTIONS_TABLE: &str = "transactions";

/// Default skip-index false positive rate (1%)
const DEFAULT_FALSE_POSITIVE_RATE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortColumn {
    pub column: Column,
    #[serde(default)]
    pub descending: bool,
}

impl SortColumn {
    pub fn asc(column: Column) -> Self {
        Self {
            column,
            descending: false,
        }
    }

    pub fn desc(column: Column) -> Self {
        Self {
            column,
            descending: true,
        }
    }
}

/// Ordering key tuple of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub columns: Vec<SortColumn>,
}

impl SortKey {
    pub fn new(columns: Vec<SortColumn>) -> Self {
        Self { columns }
    }

    /// Compare two rows by the key columns only.
    pub fn compare_keys(&self, a: &MaterializedRow, b: &MaterializedRow) -> Ordering {
        for sort in &self.columns {
            let ord = a.get(sort.column).cmp(&b.get(sort.column));
            let ord = if sort.descending { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    }

    /// Total row order: key columns, then insertion sequence (older first).
    pub fn compare(&self, a: &MaterializedRow, b: &MaterializedRow) -> Ordering {
        self.compare_keys(a, b).then_with(|| a.seq.cmp(&b.seq))
    }

    /// The first key column, used for run-level min/max pruning.
    pub fn leading(&self) -> Option<SortColumn> {
        self.columns.first().copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipIndexDef {
    pub column: Column,

    /// Target false positive rate (default: 0.01 = 1%)
    #[serde(default = "default_fp_rate")]
    pub false_positive_rate: f64,
}

fn default_fp_rate() -> f64 {
    DEFAULT_FALSE_POSITIVE_RATE
}

impl SkipIndexDef {
    pub fn bloom(column: Column) -> Self {
        Self {
            column,
            false_positive_rate: DEFAULT_FALSE_POSITIVE_RATE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub order_by: SortKey,
    #[serde(default)]
    pub skip_indexes: Vec<SkipIndexDef>,
}

impl TableSchema {
    /// The transactions table: every column, ordered by state, category and
    /// descending amount, with bloom skip indexes on state and category.
    pub fn transactions() -> Self {
        Self {
            name: TRANSACTIONS_TABLE.to_string(),
            columns: Column::ALL.to_vec(),
            order_by: SortKey::new(vec![
                SortColumn::asc(Column::UsState),
                SortColumn::asc(Column::CatId),
                SortColumn::desc(Column::Amount),
            ]),
            skip_indexes: vec![
                SkipIndexDef::bloom(Column::UsState),
                SkipIndexDef::bloom(Column::CatId),
            ],
        }
    }

    pub fn skip_index_for(&self, column: Column) -> Option<&SkipIndexDef> {
        self.skip_indexes.iter().find(|def| def.column == column)
    }

    pub fn has_column(&self, column: Column) -> bool {
        self.columns.contains(&column)
    }

    /// Structural checks run before a schema is created or reopened.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::InvalidSchema(format!("invalid table name {:?}", self.name)));
        }

        // Every row carries all columns; a table must store them all.
        for column in Column::ALL {
            if !self.has_column(column) {
                return Err(Error::InvalidSchema(format!(
                    "table {} is missing column {}",
                    self.name, column
                )));
            }
        }

        if self.order_by.columns.is_empty() {
            return Err(Error::InvalidSchema("ordering key must not be empty".to_string()));
        }

        for def in &self.skip_indexes {
            if !(def.false_positive_rate > 0.0 && def.false_positive_rate < 1.0) {
                return Err(Error::InvalidSchema(format!(
                    "skip index on {} has false positive rate {} outside (0, 1)",
                    def.column, def.false_positive_rate
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{sample_row, MaterializedRow};

    fn row(state: &str, category: &str, amount: f64, seq: u64) -> MaterializedRow {
        let mut row = MaterializedRow::from_row(sample_row(state, category, amount));
        row.seq = seq;
        row
    }

    #[test]
    fn test_transactions_order() {
        let key = TableSchema::transactions().order_by;
        let mut rows = vec![
            row("NY", "grocery", 30.0, 0),
            row("CA", "grocery", 50.0, 1),
            row("CA", "gas", 10.0, 2),
            row("CA", "gas", 80.0, 3),
            row("CA", "gas", 80.0, 4),
        ];
        rows.sort_by(|a, b| key.compare(a, b));

        let seqs: Vec<u64> = rows.iter().map(|r| r.seq).collect();
        // gas before grocery, amount descending, equal keys by seq
        assert_eq!(seqs, vec![3, 4, 2, 1, 0]);
    }

    #[test]
    fn test_validate() {
        assert!(TableSchema::transactions().validate().is_ok());

        let mut bad = TableSchema::transactions();
        bad.columns.retain(|c| *c != Column::Amount);
        assert!(bad.validate().is_err());

        let mut bad = TableSchema::transactions();
        bad.skip_indexes[0].false_positive_rate = 1.5;
        assert!(bad.validate().is_err());

        let mut bad = TableSchema::transactions();
        bad.name = "../etc".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_schema_json_defaults() {
        let json = r#"{
            "name": "t",
            "columns": ["transaction_time","merch","cat_id","name_1","name_2","gender",
                        "street","one_city","us_state","jobs","amount","lat","lon",
                        "merchant_lat","merchant_lon","population_city","target",
                        "transaction_date","partition_key"],
            "order_by": {"columns": [{"column": "merch"}]},
            "skip_indexes": [{"column": "merch"}]
        }"#;
        let schema: TableSchema = serde_json::from_str(json).unwrap();
        assert!(schema.validate().is_ok());
        assert!(!schema.order_by.columns[0].descending);
        assert_eq!(schema.skip_indexes[0].false_positive_rate, 0.01);
    }
}
