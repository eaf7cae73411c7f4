//! Row Model
//!
//! A [`Row`] is one transaction event exactly as it arrived from the queue. Rows are
//! value objects: once decoded they are never mutated.
//!
//! A [`MaterializedRow`] is a row after admission into storage. It carries the derived
//! columns computed by [`derive`](crate::derive::derive) and the insertion sequence
//! number the store assigns when the row's run is written.
//!
//! ```text
//! queue bytes ──decode──> Row ──derive──> MaterializedRow { row, transaction_date,
//!                                                           partition_key, seq }
//! ```

use crate::column::Column;
use crate::derive::{derive, DerivedColumns};
use crate::value::ValueRef;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    /// Best-effort-parseable timestamp text
    pub transaction_time: String,
    pub merch: String,
    pub cat_id: String,
    pub name_1: String,
    pub name_2: String,
    pub gender: String,
    pub street: String,
    pub one_city: String,
    pub us_state: String,
    pub jobs: String,
    pub amount: f64,
    pub lat: f64,
    pub lon: f64,
    pub merchant_lat: f64,
    pub merchant_lon: f64,
    pub population_city: f64,
    /// Fraud label; absent for unlabelled rows
    pub target: Option<u8>,
}

impl Row {
    /// Borrow a source column. Derived columns are not part of a raw row.
    pub fn get(&self, column: Column) -> Option<ValueRef<'_>> {
        let value = match column {
            Column::TransactionTime => ValueRef::Text(&self.transaction_time),
            Column::Merch => ValueRef::Text(&self.merch),
            Column::CatId => ValueRef::Text(&self.cat_id),
            Column::Name1 => ValueRef::Text(&self.name_1),
            Column::Name2 => ValueRef::Text(&self.name_2),
            Column::Gender => ValueRef::Text(&self.gender),
            Column::Street => ValueRef::Text(&self.street),
            Column::OneCity => ValueRef::Text(&self.one_city),
            Column::UsState => ValueRef::Text(&self.us_state),
            Column::Jobs => ValueRef::Text(&self.jobs),
            Column::Amount => ValueRef::Float(self.amount),
            Column::Lat => ValueRef::Float(self.lat),
            Column::Lon => ValueRef::Float(self.lon),
            Column::MerchantLat => ValueRef::Float(self.merchant_lat),
            Column::MerchantLon => ValueRef::Float(self.merchant_lon),
            Column::PopulationCity => ValueRef::Float(self.population_city),
            Column::Target => match self.target {
                Some(t) => ValueRef::UInt(t as u64),
                None => ValueRef::Null,
            },
            Column::TransactionDate | Column::PartitionKey => return None,
        };
        Some(value)
    }
}

/// A row admitted into storage, with derived columns and its insertion sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct MaterializedRow {
    pub row: Row,
    pub transaction_date: NaiveDate,
    pub partition_key: u32,
    /// Insertion sequence within the partition; assigned by the store on write
    pub seq: u64,
}

impl MaterializedRow {
    /// Derive columns for a freshly decoded row. The sequence number is assigned later.
    pub fn from_row(row: Row) -> Self {
        let DerivedColumns {
            transaction_date,
            partition_key,
        } = derive(&row);
        Self {
            row,
            transaction_date,
            partition_key,
            seq: 0,
        }
    }

    pub fn get(&self, column: Column) -> ValueRef<'_> {
        match column {
            Column::TransactionDate => ValueRef::Date(self.transaction_date),
            Column::PartitionKey => ValueRef::UInt(self.partition_key as u64),
            other => self.row.get(other).unwrap_or(ValueRef::Null),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_row(state: &str, category: &str, amount: f64) -> Row {
    Row {
        transaction_time: "2019-01-01 00:00:18".to_string(),
        merch: "fraud_Rippin, Kub and Mann".to_string(),
        cat_id: category.to_string(),
        name_1: "Jennifer".to_string(),
        name_2: "Banks".to_string(),
        gender: "F".to_string(),
        street: "561 Perry Cove".to_string(),
        one_city: "Moravian Falls".to_string(),
        us_state: state.to_string(),
        jobs: "Psychologist, counselling".to_string(),
        amount,
        lat: 36.0788,
        lon: -81.1781,
        merchant_lat: 36.011293,
        merchant_lon: -82.048315,
        population_city: 3495.0,
        target: Some(0),
    }
}
