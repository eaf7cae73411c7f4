//! Partition consumer.
//!
//! Reads one queue partition in offset order and turns messages into
//! [`Delivery`]s. Offsets are never committed here; the pipeline commits once the
//! rows of a batch are durable.
//!
//! ```text
//! fetch(offset, max) ──► decode each message ──► IntakeBatch { first..=last, deliveries }
//!        │ QueueUnavailable
//!        └─► retry_with_backoff
//! ```
//!
//! A malformed message becomes [`Delivery::Skip`]. With `skip_malformed` off the
//! consumer stops in front of it instead and every later poll fails with
//! [`IngestError::MalformedHalt`].

use crate::error::{IngestError, Result};
use crate::queue::{QueueMessage, QueueSource};
use crate::retry::{retry_with_backoff, RetryPolicy};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use txhouse_core::{codec, Error as CodecError, Row};

/// Outcome of decoding one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Row(Row),
    Skip {
        offset: u64,
        field: String,
        reason: String,
    },
}

impl Delivery {
    pub fn is_row(&self) -> bool {
        matches!(self, Delivery::Row(_))
    }
}

/// A contiguous slice of one queue partition, decoded.
#[derive(Debug, Clone)]
pub struct IntakeBatch {
    pub id: u64,
    pub partition: u32,
    pub first_offset: u64,
    pub last_offset: u64,
    pub deliveries: Vec<Delivery>,
}

impl IntakeBatch {
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }
}

/// Process-wide batch ids; acknowledgements are tracked by id.
static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_batch_id() -> u64 {
    NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn decode_message(message: &QueueMessage) -> Delivery {
    match codec::decode(&message.payload) {
        Ok(row) => Delivery::Row(row),
        Err(CodecError::MalformedRecord { field, reason }) => Delivery::Skip {
            offset: message.offset,
            field,
            reason,
        },
        Err(other) => Delivery::Skip {
            offset: message.offset,
            field: codec::MESSAGE_FIELD.to_string(),
            reason: other.to_string(),
        },
    }
}

pub struct PartitionConsumer {
    queue: Arc<dyn QueueSource>,
    partition: u32,
    position: u64,
    retry: RetryPolicy,
    skip_malformed: bool,
    halted_at: Option<(u64, String)>,
}

impl PartitionConsumer {
    pub fn new(
        queue: Arc<dyn QueueSource>,
        partition: u32,
        start_offset: u64,
        retry: RetryPolicy,
        skip_malformed: bool,
    ) -> Self {
        Self {
            queue,
            partition,
            position: start_offset,
            retry,
            skip_malformed,
            halted_at: None,
        }
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Offset of the next message to read.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_halted(&self) -> bool {
        self.halted_at.is_some()
    }

    fn halt_error(&self) -> Option<IngestError> {
        self.halted_at
            .as_ref()
            .map(|(offset, field)| IngestError::MalformedHalt {
                partition: self.partition,
                offset: *offset,
                field: field.clone(),
            })
    }

    /// Fetch up to `max_batch` raw messages, retrying transient queue failures.
    pub async fn poll(&mut self, max_batch: usize) -> Result<Vec<QueueMessage>> {
        if let Some(err) = self.halt_error() {
            return Err(err);
        }

        let queue = &self.queue;
        let (partition, offset) = (self.partition, self.position);
        let messages = retry_with_backoff(&self.retry, || {
            queue.fetch(partition, offset, max_batch.max(1))
        })
        .await?;

        if let Some(last) = messages.last() {
            self.position = last.offset + 1;
        }
        Ok(messages)
    }

    /// Poll and decode. Returns `None` when the partition has nothing new.
    pub async fn next_batch(&mut self, max_batch: usize) -> Result<Option<IntakeBatch>> {
        let messages = self.poll(max_batch).await?;
        let Some(first) = messages.first().map(|m| m.offset) else {
            return Ok(None);
        };

        let mut deliveries = Vec::with_capacity(messages.len());
        let mut last_offset = first;
        for message in &messages {
            let delivery = decode_message(message);
            if let Delivery::Skip { field, reason, .. } = &delivery {
                if !self.skip_malformed {
                    tracing::error!(
                        partition = self.partition,
                        offset = message.offset,
                        field = %field,
                        reason = %reason,
                        "malformed message, halting partition"
                    );
                    self.position = message.offset;
                    self.halted_at = Some((message.offset, field.clone()));
                    break;
                }
                tracing::warn!(
                    partition = self.partition,
                    offset = message.offset,
                    field = %field,
                    reason = %reason,
                    "skipping malformed message"
                );
            }
            deliveries.push(delivery);
            last_offset = message.offset;
        }

        if deliveries.is_empty() {
            // Halted on the first message of the batch.
            return Err(self.halt_error().unwrap_or(IngestError::PipelineStopped));
        }
        Ok(Some(IntakeBatch {
            id: next_batch_id(),
            partition: self.partition,
            first_offset: first,
            last_offset,
            deliveries,
        }))
    }
}
