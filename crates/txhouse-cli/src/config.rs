//! Configuration for txctl
//!
//! Optional TOML file, every section optional:
//!
//! ```toml
//! [store]
//! data_dir = "/var/lib/txhouse"
//! fsync = true
//!
//! [ingest]
//! max_batch = 500
//! run_max_rows = 10000
//!
//! [query]
//! timeout_ms = 30000
//!
//! [compaction]
//! min_runs = 4
//!
//! [loader]
//! queue_partitions = 4
//! ```
//!
//! `--data-dir` / `TXHOUSE_DATA_DIR` override `store.data_dir`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use txhouse_ingest::IngestConfig;
use txhouse_query::QueryConfig;
use txhouse_storage::{CompactionConfig, StoreConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub compaction: CompactionConfig,

    #[serde(default)]
    pub loader: LoaderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Topic the bulk loader publishes to (default: transactions)
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Queue partitions rows are spread over (default: 4)
    #[serde(default = "default_queue_partitions")]
    pub queue_partitions: u32,

    /// How long `load` waits for every message to be committed, in milliseconds
    /// (default: 10 min)
    #[serde(default = "default_load_timeout_ms")]
    pub load_timeout_ms: u64,
}

fn default_topic() -> String {
    "transactions".to_string()
}

fn default_queue_partitions() -> u32 {
    4
}

fn default_load_timeout_ms() -> u64 {
    600_000
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            queue_partitions: default_queue_partitions(),
            load_timeout_ms: default_load_timeout_ms(),
        }
    }
}

impl Config {
    /// Load from `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Config::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    pub fn with_data_dir(mut self, data_dir: Option<PathBuf>) -> Self {
        if let Some(dir) = data_dir {
            self.store.data_dir = dir;
        }
        self
    }
}
