//! Column identifiers for the transactions table.
//!
//! Every source field of a [`Row`](crate::Row) plus the two derived columns has a
//! [`Column`] variant. Sort keys, skip indexes, scan predicates and query group-by
//! clauses all refer to columns through this enum, so an unknown column name is
//! rejected once at the boundary (`Column::from_str`) instead of deep inside a scan.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    TransactionTime,
    Merch,
    CatId,
    #[serde(rename = "name_1")]
    Name1,
    #[serde(rename = "name_2")]
    Name2,
    Gender,
    Street,
    OneCity,
    UsState,
    Jobs,
    Amount,
    Lat,
    Lon,
    MerchantLat,
    MerchantLon,
    PopulationCity,
    Target,
    TransactionDate,
    PartitionKey,
}

/// Physical type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Float,
    /// Optional unsigned 8-bit integer (`target`)
    NullableU8,
    Date,
    /// Unsigned 32-bit integer (`partition_key`)
    UInt32,
}

impl Column {
    /// All columns in storage order.
    pub const ALL: [Column; 19] = [
        Column::TransactionTime,
        Column::Merch,
        Column::CatId,
        Column::Name1,
        Column::Name2,
        Column::Gender,
        Column::Street,
        Column::OneCity,
        Column::UsState,
        Column::Jobs,
        Column::Amount,
        Column::Lat,
        Column::Lon,
        Column::MerchantLat,
        Column::MerchantLon,
        Column::PopulationCity,
        Column::Target,
        Column::TransactionDate,
        Column::PartitionKey,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Column::TransactionTime => "transaction_time",
            Column::Merch => "merch",
            Column::CatId => "cat_id",
            Column::Name1 => "name_1",
            Column::Name2 => "name_2",
            Column::Gender => "gender",
            Column::Street => "street",
            Column::OneCity => "one_city",
            Column::UsState => "us_state",
            Column::Jobs => "jobs",
            Column::Amount => "amount",
            Column::Lat => "lat",
            Column::Lon => "lon",
            Column::MerchantLat => "merchant_lat",
            Column::MerchantLon => "merchant_lon",
            Column::PopulationCity => "population_city",
            Column::Target => "target",
            Column::TransactionDate => "transaction_date",
            Column::PartitionKey => "partition_key",
        }
    }

    pub fn kind(self) -> ColumnKind {
        match self {
            Column::TransactionTime
            | Column::Merch
            | Column::CatId
            | Column::Name1
            | Column::Name2
            | Column::Gender
            | Column::Street
            | Column::OneCity
            | Column::UsState
            | Column::Jobs => ColumnKind::Text,
            Column::Amount
            | Column::Lat
            | Column::Lon
            | Column::MerchantLat
            | Column::MerchantLon
            | Column::PopulationCity => ColumnKind::Float,
            Column::Target => ColumnKind::NullableU8,
            Column::TransactionDate => ColumnKind::Date,
            Column::PartitionKey => ColumnKind::UInt32,
        }
    }

    /// Stable on-disk identifier used by the run file format.
    pub fn id(self) -> u16 {
        Column::ALL
            .iter()
            .position(|c| *c == self)
            .map(|p| p as u16)
            .unwrap_or(u16::MAX)
    }

    pub fn from_id(id: u16) -> Option<Column> {
        Column::ALL.get(id as usize).copied()
    }

    /// Whether the column is computed at materialization time rather than decoded.
    pub fn is_derived(self) -> bool {
        matches!(self, Column::TransactionDate | Column::PartitionKey)
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Column {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Column::ALL
            .iter()
            .copied()
            .find(|c| c.name() == s)
            .ok_or_else(|| Error::UnknownColumn(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        for column in Column::ALL {
            assert_eq!(column.name().parse::<Column>().unwrap(), column);
            assert_eq!(Column::from_id(column.id()), Some(column));
        }
    }

    #[test]
    fn test_unknown_column() {
        let err = "merchant".parse::<Column>().unwrap_err();
        assert!(matches!(err, Error::UnknownColumn(name) if name == "merchant"));
    }

    #[test]
    fn test_serde_names_match_wire_names() {
        let json = serde_json::to_string(&Column::Name1).unwrap();
        assert_eq!(json, "\"name_1\"");
        let json = serde_json::to_string(&Column::UsState).unwrap();
        assert_eq!(json, "\"us_state\"");
    }
}
