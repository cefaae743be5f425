use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// A single record as delivered to the application handler.
#[derive(Debug, Clone)]
pub struct Message {
    /// Partition key the producer wrote the record with.
    pub partition_key: String,
    /// Opaque record body.
    pub data: Bytes,
    /// Sequence number, monotonic within the shard.
    pub sequence_number: String,
    /// Shard the record was read from.
    pub shard_id: String,
    /// Approximate arrival time at the stream, when the service reports
    /// one.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Error a handler may return to refuse a record.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback invoked once per record, sequentially within a
/// shard.
///
/// Returning an error means "do not advance past this record": the
/// checkpoint is not moved and the same position is retried on the next
/// tick. A panic inside the handler is contained and treated the same
/// way.
pub type MessageHandler = Arc<dyn Fn(Message) -> Result<(), HandlerError> + Send + Sync>;
