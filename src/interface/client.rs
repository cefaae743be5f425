use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::ClientError;

/// A shard as reported by the stream service, with its resharding
/// lineage. One parent means the shard came out of a split, two out of a
/// merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    pub id: String,
    pub parent_ids: Vec<String>,
}

/// Read position used to acquire a shard iterator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorPosition {
    /// Oldest record still retained.
    TrimHorizon,
    /// The next record to arrive.
    Latest,
    /// Exactly at the given sequence number.
    AtSequenceNumber(String),
    /// Immediately after the given sequence number.
    AfterSequenceNumber(String),
}

/// One record in a fetch reply.
#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub partition_key: String,
    pub data: Bytes,
    pub sequence_number: String,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Reply to a record fetch. A missing `next_iterator` means the shard is
/// closed and fully read; `records` may still carry its final batch.
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<StreamRecord>,
    pub next_iterator: Option<String>,
    pub millis_behind_latest: Option<i64>,
}

/// Thin abstraction over the stream service.
///
/// Implementations must be safe for concurrent use; one worker per shard
/// plus the coordinator call into the same client.
#[async_trait]
pub trait StreamClient: Send + Sync {
    /// All shards of `stream`, including closed ones still retained for
    /// draining, with parent links describing the resharding topology.
    async fn list_shards(&self, stream: &str) -> Result<Vec<Shard>, ClientError>;

    /// Obtain an iterator into `shard_id` at `position`.
    async fn get_shard_iterator(
        &self,
        stream: &str,
        shard_id: &str,
        position: IteratorPosition,
    ) -> Result<String, ClientError>;

    /// Fetch the next batch of records at `iterator`.
    async fn get_records(&self, iterator: &str) -> Result<RecordBatch, ClientError>;
}
