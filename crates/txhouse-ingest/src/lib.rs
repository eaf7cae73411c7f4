//! txhouse-ingest: from queue messages to durable sorted runs.
//!
//! ## Main types
//!
//! - [`QueueSource`] / [`MemoryQueue`]: partitioned, replayable message source
//! - [`PartitionConsumer`]: polls one queue partition and decodes messages
//! - [`Materializer`]: derives columns and buffers rows into per-partition runs
//! - [`IngestPipeline`]: consumers, dispatcher and storage shards wired together
//! - [`OffsetStore`]: where committed offsets live
//!
//! ## Quick start
//!
//! ```ignore
//! let queue = Arc::new(MemoryQueue::new("transactions", 4));
//! let pipeline = IngestPipeline::new(
//!     IngestConfig::default(),
//!     queue.clone(),
//!     Arc::new(MemoryOffsetStore::new()),
//!     store,
//! );
//! pipeline.start().await?;
//! queue.assign_all();
//! // ...
//! pipeline.shutdown().await?;
//! ```

pub mod ack;
pub mod config;
pub mod consumer;
pub mod error;
pub mod materializer;
pub mod offsets;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod stats;

pub use ack::AckTracker;
pub use config::IngestConfig;
pub use consumer::{Delivery, IntakeBatch, PartitionConsumer};
pub use error::{IngestError, Result};
pub use materializer::{MaterializeResult, Materializer};
pub use offsets::{FileOffsetStore, MemoryOffsetStore, OffsetStore};
pub use pipeline::IngestPipeline;
pub use queue::{AssignmentEvent, MemoryQueue, PartitionAssignment, QueueMessage, QueueSource};
pub use retry::RetryPolicy;
pub use stats::{IngestStats, IngestStatsSnapshot};
