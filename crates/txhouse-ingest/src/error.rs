//! Error types for the ingestion pipeline.
//!
//! - `QueueUnavailable`: transient; retried with backoff by the consumer
//! - `MalformedHalt`: a malformed message stopped a queue partition because
//!   `skip_malformed` is off
//! - `Storage`: a run could not be made durable; halts the affected storage partition

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("unknown queue partition: {0}")]
    UnknownPartition(u32),

    #[error("malformed message at {partition}:{offset} (field `{field}`), partition halted")]
    MalformedHalt {
        partition: u32,
        offset: u64,
        field: String,
    },

    #[error("offset store error: {0}")]
    Offset(String),

    #[error("pipeline already running")]
    AlreadyRunning,

    #[error("pipeline stopped")]
    PipelineStopped,

    #[error(transparent)]
    Storage(#[from] txhouse_storage::Error),

    #[error(transparent)]
    Codec(#[from] txhouse_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IngestError {
    /// Transient failures worth retrying with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, IngestError::QueueUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
