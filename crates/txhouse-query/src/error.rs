//! Query error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Timeout: query exceeded {budget_ms}ms limit")]
    Timeout { budget_ms: u64 },

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error(transparent)]
    Storage(#[from] txhouse_storage::Error),
}

pub type Result<T> = std::result::Result<T, QueryError>;
