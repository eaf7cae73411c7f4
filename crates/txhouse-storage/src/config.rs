//! Storage Configuration
//!
//! ## StoreConfig
//!
//! Controls where runs live and how they are written and merged:
//!
//! - **data_dir**: root directory; each table gets `<data_dir>/<table>/p<YYYYMM>/`
//! - **compression**: column block compression for run files (default: lz4)
//! - **fsync**: fsync run files and manifests before they become visible (default: true)
//! - **max_runs_per_compaction**: upper bound on runs merged in one pass (default: 16)
//! - **max_conflict_retries**: retries when a compaction's inputs change underneath
//!   it (default: 3)
//!
//! ## Usage
//!
//! ```ignore
//! use txhouse_storage::StoreConfig;
//!
//! let config = StoreConfig {
//!     data_dir: "/var/lib/txhouse".into(),
//!     ..Default::default()
//! };
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root data directory (default: ./data)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Column block compression (default: lz4)
    #[serde(default)]
    pub compression: Compression,

    /// Fsync files before publishing them (default: true)
    #[serde(default = "default_fsync")]
    pub fsync: bool,

    /// Maximum runs merged by one compaction (default: 16)
    #[serde(default = "default_max_runs_per_compaction")]
    pub max_runs_per_compaction: usize,

    /// Compaction install retries on conflict (default: 3)
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Lz4,
}

impl Compression {
    pub(crate) fn id(self) -> u16 {
        match self {
            Compression::None => 0,
            Compression::Lz4 => 1,
        }
    }

    pub(crate) fn from_id(id: u16) -> Option<Self> {
        match id {
            0 => Some(Compression::None),
            1 => Some(Compression::Lz4),
            _ => None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_fsync() -> bool {
    true
}

fn default_max_runs_per_compaction() -> usize {
    16
}

fn default_max_conflict_retries() -> u32 {
    3
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            compression: Compression::default(),
            fsync: default_fsync(),
            max_runs_per_compaction: default_max_runs_per_compaction(),
            max_conflict_retries: default_max_conflict_retries(),
        }
    }
}

impl StoreConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }
}
