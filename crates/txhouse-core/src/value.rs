//! Typed column values.
//!
//! [`ValueRef`] borrows from a stored row and is what sort-key comparison, skip-index lookups
//! and group-key lookups work on, so merging never clones strings. [`Value`] is the owned form
//! used in predicates, manifests and query results.
//!
//! Both carry a total order (floats compare with `f64::total_cmp`) and hash floats by
//! bit pattern, which keeps `Eq`, `Ord` and `Hash` consistent with each other and lets
//! values act as aggregation group keys.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Text(String),
    Float(#[serde(with = "float_bits")] f64),
    UInt(u64),
    Date(NaiveDate),
}

#[derive(Debug, Clone, Copy)]
pub enum ValueRef<'a> {
    Null,
    Text(&'a str),
    Float(f64),
    UInt(u64),
    Date(NaiveDate),
}

// Tags for index encoding; also the cross-variant sort order.
const TAG_NULL: u8 = 0;
const TAG_TEXT: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_UINT: u8 = 3;
const TAG_DATE: u8 = 4;

impl<'a> ValueRef<'a> {
    fn tag(&self) -> u8 {
        match self {
            ValueRef::Null => TAG_NULL,
            ValueRef::Text(_) => TAG_TEXT,
            ValueRef::Float(_) => TAG_FLOAT,
            ValueRef::UInt(_) => TAG_UINT,
            ValueRef::Date(_) => TAG_DATE,
        }
    }

    pub fn to_owned_value(self) -> Value {
        match self {
            ValueRef::Null => Value::Null,
            ValueRef::Text(s) => Value::Text(s.to_string()),
            ValueRef::Float(f) => Value::Float(f),
            ValueRef::UInt(u) => Value::UInt(u),
            ValueRef::Date(d) => Value::Date(d),
        }
    }

    /// Numeric view used by aggregations. Text, dates and nulls have none.
    pub fn as_f64(self) -> Option<f64> {
        match self {
            ValueRef::Float(f) => Some(f),
            ValueRef::UInt(u) => Some(u as f64),
            _ => None,
        }
    }

    /// Byte encoding fed to skip-index filters.
    ///
    /// The leading tag keeps `Null` distinct from an empty string and keeps values of
    /// different kinds from colliding.
    pub fn index_bytes(self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9);
        out.push(self.tag());
        match self {
            ValueRef::Null => {}
            ValueRef::Text(s) => out.extend_from_slice(s.as_bytes()),
            ValueRef::Float(f) => out.extend_from_slice(&f.to_bits().to_le_bytes()),
            ValueRef::UInt(u) => out.extend_from_slice(&u.to_le_bytes()),
            ValueRef::Date(d) => out.extend_from_slice(&d.num_days_from_ce().to_le_bytes()),
        }
        out
    }
}

impl Value {
    pub fn as_ref(&self) -> ValueRef<'_> {
        match self {
            Value::Null => ValueRef::Null,
            Value::Text(s) => ValueRef::Text(s),
            Value::Float(f) => ValueRef::Float(*f),
            Value::UInt(u) => ValueRef::UInt(*u),
            Value::Date(d) => ValueRef::Date(*d),
        }
    }

    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_ref().as_f64()
    }

    pub fn index_bytes(&self) -> Vec<u8> {
        self.as_ref().index_bytes()
    }
}

impl PartialEq for ValueRef<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ValueRef<'_> {}

impl PartialOrd for ValueRef<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ValueRef<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (ValueRef::Null, ValueRef::Null) => Ordering::Equal,
            (ValueRef::Text(a), ValueRef::Text(b)) => a.cmp(b),
            (ValueRef::Float(a), ValueRef::Float(b)) => a.total_cmp(b),
            (ValueRef::UInt(a), ValueRef::UInt(b)) => a.cmp(b),
            (ValueRef::Date(a), ValueRef::Date(b)) => a.cmp(b),
            _ => self.tag().cmp(&other.tag()),
        }
    }
}

impl Hash for ValueRef<'_> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        match self {
            ValueRef::Null => {}
            ValueRef::Text(s) => s.hash(state),
            ValueRef::Float(f) => f.to_bits().hash(state),
            ValueRef::UInt(u) => u.hash(state),
            ValueRef::Date(d) => d.hash(state),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_ref().cmp(&other.as_ref())
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_ref().hash(state)
    }
}

impl fmt::Display for ValueRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueRef::Null => f.write_str("NULL"),
            ValueRef::Text(s) => f.write_str(s),
            ValueRef::Float(v) => write!(f, "{}", v),
            ValueRef::UInt(u) => write!(f, "{}", u),
            ValueRef::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Option<u8>> for Value {
    fn from(v: Option<u8>) -> Self {
        v.map_or(Value::Null, |v| Value::UInt(v as u64))
    }
}

/// Floats are persisted by bit pattern so NaN and infinities survive a JSON manifest.
mod float_bits {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.to_bits())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        u64::deserialize(deserializer).map(f64::from_bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_null_and_empty_string_are_distinct() {
        assert_ne!(Value::Null, Value::text(""));
        assert_ne!(Value::Null.index_bytes(), Value::text("").index_bytes());
    }

    #[test]
    fn test_float_total_order() {
        let mut values = vec![Value::Float(3.0), Value::Float(f64::NAN), Value::Float(-1.0)];
        values.sort();
        assert_eq!(values[0], Value::Float(-1.0));
        assert_eq!(values[1], Value::Float(3.0));
        assert!(matches!(values[2], Value::Float(f) if f.is_nan()));
    }

    #[test]
    fn test_values_hash_as_group_keys() {
        let mut set = HashSet::new();
        set.insert(Value::text("CA"));
        set.insert(Value::text("CA"));
        set.insert(Value::Float(1.5));
        set.insert(Value::Float(1.5));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_manifest_serde_preserves_nan() {
        let json = serde_json::to_string(&Value::Float(f64::NAN)).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, Value::Float(f) if f.is_nan()));

        let json = serde_json::to_string(&Value::text("NY")).unwrap();
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Value::text("NY"));
    }
}
