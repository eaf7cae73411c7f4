//! Ingestion pipeline configuration.
//!
//! Every field has a serde default so a partial TOML section is enough:
//!
//! ```toml
//! [ingest]
//! group_id = "txhouse-materializer"
//! max_batch = 500
//! run_max_rows = 10000
//! ```

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Consumer group whose committed offsets the pipeline owns
    #[serde(default = "default_group_id")]
    pub group_id: String,

    /// Maximum messages per poll (default: 500)
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,

    /// Sleep between polls of an idle partition in milliseconds (default: 100)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Batches buffered between consumers and the dispatcher (default: 16)
    #[serde(default = "default_intake_capacity")]
    pub intake_capacity: usize,

    /// Batches buffered per storage-partition shard (default: 16)
    #[serde(default = "default_shard_capacity")]
    pub shard_capacity: usize,

    /// Rows after which an active run is sealed (default: 10000)
    #[serde(default = "default_run_max_rows")]
    pub run_max_rows: usize,

    /// Age after which a non-empty active run is sealed, in milliseconds (default: 5s)
    #[serde(default = "default_run_max_age_ms")]
    pub run_max_age_ms: u64,

    /// How often shards check active runs for age, in milliseconds (default: 1s)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Skip malformed messages instead of halting their queue partition (default: true)
    #[serde(default = "default_skip_malformed")]
    pub skip_malformed: bool,

    /// How long shutdown waits for in-flight runs to become durable (default: 30s)
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_group_id() -> String {
    "txhouse-materializer".to_string()
}

fn default_max_batch() -> usize {
    500
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_intake_capacity() -> usize {
    16
}

fn default_shard_capacity() -> usize {
    16
}

fn default_run_max_rows() -> usize {
    10_000
}

fn default_run_max_age_ms() -> u64 {
    5_000
}

fn default_flush_interval_ms() -> u64 {
    1_000
}

fn default_skip_malformed() -> bool {
    true
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            group_id: default_group_id(),
            max_batch: default_max_batch(),
            poll_interval_ms: default_poll_interval_ms(),
            intake_capacity: default_intake_capacity(),
            shard_capacity: default_shard_capacity(),
            run_max_rows: default_run_max_rows(),
            run_max_age_ms: default_run_max_age_ms(),
            flush_interval_ms: default_flush_interval_ms(),
            skip_malformed: default_skip_malformed(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl IngestConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn run_max_age(&self) -> Duration {
        Duration::from_millis(self.run_max_age_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: IngestConfig = from_json(r#"{"max_batch": 50, "retry": {"max_retries": 1}}"#);
        assert_eq!(config.max_batch, 50);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_backoff_ms, 100);
        assert_eq!(config.run_max_rows, 10_000);
        assert!(config.skip_malformed);
    }

    fn from_json(json: &str) -> IngestConfig {
        serde_json::from_str(json).unwrap()
    }
}
