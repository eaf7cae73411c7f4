//! Error Types for txhouse-core
//!
//! ## Error Categories
//!
//! ### Record Errors
//! - `MalformedRecord`: a queue message could not be decoded into a [`Row`](crate::Row).
//!   The `field` names the offending column, or `<message>` when the body itself is
//!   not a JSON object.
//!
//! ### Schema Errors
//! - `InvalidSchema`, `UnknownColumn`: rejected table definitions and column names
//!
//! ### Data Integrity Errors
//! - `InvalidMagic`: run file doesn't start or end with the expected magic bytes ("TXRN")
//! - `CrcMismatch`: data corruption detected via checksum
//! - `InvalidRun`: structurally malformed run data (truncated column, bad length)
//!
//! ### Version/Compatibility Errors
//! - `UnsupportedVersion`: run was written in a format version this build does not read
//! - `InvalidCompression`: unknown compression type ID
//!
//! ## Usage
//! Every fallible function in this crate returns [`Result<T>`], aliased to
//! `Result<T, Error>`, so `?` propagates across layers.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed record: field `{field}`: {reason}")]
    MalformedRecord { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid magic bytes")]
    InvalidMagic,

    #[error("Unsupported version: {0}")]
    UnsupportedVersion(u16),

    #[error("Invalid compression type: {0}")]
    InvalidCompression(u16),

    #[error("CRC mismatch: expected {expected:#010x}, got {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("Invalid run: {0}")]
    InvalidRun(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn malformed(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::MalformedRecord {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The column named by a `MalformedRecord`, if this is one.
    pub fn malformed_field(&self) -> Option<&str> {
        match self {
            Error::MalformedRecord { field, .. } => Some(field),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
