//! Error Types for txhouse-storage
//!
//! - `StorageWriteFailure`: a run or manifest could not be made durable. The
//!   partition's previous state is still intact; the caller decides whether to halt.
//! - `CompactionConflict`: a compaction tried to install its output after its inputs
//!   were already replaced. Handled inside the store by retrying; never returned from
//!   the public API.
//! - `Format`: run file or skip-index sidecar failed validation on read.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage write failed for partition {partition}: {source}")]
    StorageWriteFailure {
        partition: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("compaction conflict on partition {partition}: inputs changed during merge")]
    CompactionConflict { partition: u32 },

    #[error("compaction already in progress for partition {0}")]
    CompactionInProgress(u32),

    #[error("partition not found: {0}")]
    PartitionNotFound(u32),

    #[error("row with partition key {found} written to partition {expected}")]
    PartitionMismatch { expected: u32, found: u32 },

    #[error("table already exists: {0}")]
    TableExists(String),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Format(#[from] txhouse_core::Error),
}

impl Error {
    pub(crate) fn write_failure(partition: u32, source: std::io::Error) -> Self {
        Error::StorageWriteFailure { partition, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
