//! Top-N per group
//!
//! "For every `group_by` value, which `secondary` values have the highest
//! aggregated `measure`?" The default query answers the top category by maximum
//! transaction amount in each state:
//!
//! ```text
//! SELECT us_state, cat_id, max(amount) AS m
//! FROM transactions GROUP BY us_state, cat_id
//! → rank cat_id within each us_state by m desc, ties by cat_id asc
//! → keep rank <= rank_limit, order by us_state, rank
//! ```

use crate::error::{QueryError, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use txhouse_core::{Column, ColumnKind, MaterializedRow, TableSchema, Value, ValueRef};
use txhouse_storage::{ColumnPredicate, PartitionFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Max,
    Min,
    Sum,
    Count,
}

#[derive(Debug, Clone)]
pub struct TopNQuery {
    pub group_by: Column,
    pub secondary: Column,
    pub measure: Column,
    pub aggregation: Aggregation,
    /// Rows kept per group (default: 1)
    pub rank_limit: usize,
    pub partitions: PartitionFilter,
    pub filters: Vec<ColumnPredicate>,
}

impl Default for TopNQuery {
    fn default() -> Self {
        Self::top_category_by_state()
    }
}

impl TopNQuery {
    pub fn new(group_by: Column, secondary: Column, measure: Column) -> Self {
        Self {
            group_by,
            secondary,
            measure,
            aggregation: Aggregation::Max,
            rank_limit: 1,
            partitions: PartitionFilter::All,
            filters: Vec::new(),
        }
    }

    /// Highest single transaction amount per state, with its category.
    pub fn top_category_by_state() -> Self {
        Self::new(Column::UsState, Column::CatId, Column::Amount)
    }

    pub fn aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn rank_limit(mut self, limit: usize) -> Self {
        self.rank_limit = limit;
        self
    }

    pub fn partitions(mut self, filter: PartitionFilter) -> Self {
        self.partitions = filter;
        self
    }

    pub fn filter(mut self, predicate: ColumnPredicate) -> Self {
        self.filters.push(predicate);
        self
    }

    pub fn validate(&self, schema: &TableSchema) -> Result<()> {
        if self.rank_limit == 0 {
            return Err(QueryError::InvalidQuery("rank_limit must be at least 1".to_string()));
        }
        if self.group_by == self.secondary {
            return Err(QueryError::InvalidQuery(format!(
                "group_by and secondary are both {}",
                self.group_by
            )));
        }
        let mut columns = vec![self.group_by, self.secondary, self.measure];
        columns.extend(self.filters.iter().map(|f| f.column));
        if let Some(missing) = columns.into_iter().find(|c| !schema.has_column(*c)) {
            return Err(QueryError::InvalidQuery(format!(
                "column {} is not in table {}",
                missing, schema.name
            )));
        }
        let numeric = matches!(
            self.measure.kind(),
            ColumnKind::Float | ColumnKind::NullableU8 | ColumnKind::UInt32
        );
        if !numeric && self.aggregation != Aggregation::Count {
            return Err(QueryError::InvalidQuery(format!(
                "cannot aggregate non-numeric column {}",
                self.measure
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopNRow {
    pub primary: Value,
    pub secondary: Value,
    pub value: f64,
    /// 1-based rank within `primary`
    pub rank: usize,
}

#[derive(Debug, Clone, Copy)]
struct Accumulator {
    value: Option<f64>,
    count: u64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            value: None,
            count: 0,
        }
    }

    fn update(&mut self, aggregation: Aggregation, measure: Option<f64>) {
        self.count += 1;
        // NaN and null measures take part in COUNT only.
        let Some(x) = measure.filter(|x| !x.is_nan()) else {
            return;
        };
        self.value = Some(match (aggregation, self.value) {
            (_, None) => x,
            (Aggregation::Max, Some(v)) => v.max(x),
            (Aggregation::Min, Some(v)) => v.min(x),
            (Aggregation::Sum, Some(v)) => v + x,
            (Aggregation::Count, Some(v)) => v,
        });
    }

    fn finish(self, aggregation: Aggregation) -> Option<f64> {
        match aggregation {
            Aggregation::Count => Some(self.count as f64),
            _ => self.value,
        }
    }
}

/// Owned `(group_by, secondary)` pair stored in the aggregation table.
#[derive(Debug)]
struct GroupKey {
    primary: Value,
    secondary: Value,
}

/// Borrowed view of a group key. Lets a row look up its group without cloning
/// either value; only a group's first row allocates.
trait GroupKeyView {
    fn view(&self) -> (ValueRef<'_>, ValueRef<'_>);
}

impl GroupKeyView for GroupKey {
    fn view(&self) -> (ValueRef<'_>, ValueRef<'_>) {
        (self.primary.as_ref(), self.secondary.as_ref())
    }
}

impl GroupKeyView for (ValueRef<'_>, ValueRef<'_>) {
    fn view(&self) -> (ValueRef<'_>, ValueRef<'_>) {
        *self
    }
}

// Owned and borrowed keys must hash and compare identically.
impl Hash for dyn GroupKeyView + '_ {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.view().hash(state)
    }
}

impl PartialEq for dyn GroupKeyView + '_ {
    fn eq(&self, other: &Self) -> bool {
        self.view() == other.view()
    }
}

impl Eq for dyn GroupKeyView + '_ {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.view().hash(state)
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        self.view() == other.view()
    }
}

impl Eq for GroupKey {}

impl<'a> Borrow<dyn GroupKeyView + 'a> for GroupKey {
    fn borrow(&self) -> &(dyn GroupKeyView + 'a) {
        self
    }
}

/// Streaming hash aggregation. Memory grows with distinct (primary, secondary) pairs.
#[derive(Debug)]
pub struct GroupAggregator {
    group_by: Column,
    secondary: Column,
    measure: Column,
    aggregation: Aggregation,
    groups: HashMap<GroupKey, Accumulator>,
}

impl GroupAggregator {
    pub fn new(query: &TopNQuery) -> Self {
        Self {
            group_by: query.group_by,
            secondary: query.secondary,
            measure: query.measure,
            aggregation: query.aggregation,
            groups: HashMap::new(),
        }
    }

    pub fn push(&mut self, row: &MaterializedRow) {
        let aggregation = self.aggregation;
        let measure = row.get(self.measure).as_f64();
        let key = (row.get(self.group_by), row.get(self.secondary));

        if let Some(acc) = self.groups.get_mut(&key as &dyn GroupKeyView) {
            acc.update(aggregation, measure);
            return;
        }
        let mut acc = Accumulator::new();
        acc.update(aggregation, measure);
        self.groups.insert(
            GroupKey {
                primary: key.0.to_owned_value(),
                secondary: key.1.to_owned_value(),
            },
            acc,
        );
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Rank secondaries within each primary and keep the top `rank_limit`.
    /// Groups without any usable measure are dropped.
    pub fn finish(self, rank_limit: usize) -> Vec<TopNRow> {
        let aggregation = self.aggregation;
        let mut by_primary: BTreeMap<Value, Vec<(Value, f64)>> = BTreeMap::new();
        for (GroupKey { primary, secondary }, acc) in self.groups {
            if let Some(value) = acc.finish(aggregation) {
                by_primary.entry(primary).or_default().push((secondary, value));
            }
        }

        let mut out = Vec::new();
        for (primary, mut candidates) in by_primary {
            candidates.sort_by(|a, b| rank_order(a, b));
            for (i, (secondary, value)) in candidates.into_iter().take(rank_limit).enumerate() {
                out.push(TopNRow {
                    primary: primary.clone(),
                    secondary,
                    value,
                    rank: i + 1,
                });
            }
        }
        out
    }
}

/// Highest value first; equal values by secondary ascending.
fn rank_order(a: &(Value, f64), b: &(Value, f64)) -> Ordering {
    b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0))
}
