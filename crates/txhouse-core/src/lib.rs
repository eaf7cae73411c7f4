//! txhouse-core: shared data model for the txhouse ingestion engine.
//!
//! ## What lives here
//!
//! - [`Row`]: one transaction event as decoded from the queue
//! - [`codec`]: JSON wire format of queue messages
//! - [`derive`]: `transaction_date` and `partition_key` derivation
//! - [`Column`], [`Value`], [`ValueRef`]: typed column access for keys, indexes
//!   and queries
//! - [`TableSchema`] and [`SortKey`]: ordering key and skip-index declarations
//! - [`varint`]: compact integer encoding used by the run file format
//!
//! ## Flow
//!
//! ```text
//! bytes ─► codec::decode ─► Row ─► MaterializedRow::from_row ─► storage
//!                                  (transaction_date, partition_key)
//! ```

pub mod codec;
pub mod column;
pub mod derive;
pub mod error;
pub mod row;
pub mod schema;
pub mod value;
pub mod varint;

pub use column::{Column, ColumnKind};
pub use derive::DerivedColumns;
pub use error::{Error, Result};
pub use row::{MaterializedRow, Row};
pub use schema::{SkipIndexDef, SortColumn, SortKey, TableSchema, TRANSACTIONS_TABLE};
pub use value::{Value, ValueRef};
