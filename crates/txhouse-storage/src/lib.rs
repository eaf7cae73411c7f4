//! txhouse-storage: partitioned columnar storage for transaction rows.
//!
//! ## Architecture
//!
//! ```text
//! Catalog
//!   └─ PartitionedStore (one per table)
//!        ├─ p201901/  ── RunSet snapshot ── [run 3] [run 7] [run 9]
//!        ├─ p201902/  ── RunSet snapshot ── [run 4]
//!        └─ ...
//!
//! each run:  run-<id>.run  (columnar row groups, lz4 blocks, crc32 footer)
//!            run-<id>.idx  (bloom skip index per indexed column)
//! ```
//!
//! ## Main types
//!
//! - [`ActiveRun`] / [`SortedRun`]: rows before and after sealing
//! - [`PartitionedStore`]: write, scan, compact, drop, introspection
//! - [`ScanRequest`] / [`RowScan`]: pruned, lazy, ordered reads
//! - [`SkipIndex`]: per-run bloom filters
//! - [`CompactionScheduler`]: background merging with a manual trigger
//! - [`Catalog`] / [`SchemaStatement`]: idempotent table create and drop
//!
//! ## Guarantees
//!
//! - A run is visible only after its file, sidecar and manifest entry are durable.
//! - Scans return rows in ordering-key order across every selected partition; equal
//!   keys by partition key, then insertion order.
//! - Compaction preserves the multiset of rows and never blocks writers of other
//!   partitions.

pub mod catalog;
pub mod compaction;
pub mod config;
pub mod error;
pub mod merge;
pub mod partition;
pub mod run;
pub mod scan;
pub mod skip_index;
pub mod store;

pub use catalog::{Catalog, SchemaStatement, StatementOutcome};
pub use compaction::{CompactionConfig, CompactionScheduler, CompactionStats};
pub use config::{Compression, StoreConfig};
pub use error::{Error, Result};
pub use run::{ActiveRun, RunMeta, SortedRun};
pub use scan::{ColumnPredicate, KeyPrefix, PartitionFilter, RowScan, ScanRequest};
pub use skip_index::{FilterEntry, SkipIndex, SkipIndexStats};
pub use store::{CompactionOutcome, PartitionInfo, PartitionedStore};
