use async_trait::async_trait;

use crate::error::CheckpointError;

/// The `(group, stream, shard)` triple a checkpoint belongs to.
///
/// [`key`](CheckpointIdentifier::key) renders the triple to the opaque
/// string handed to the store verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointIdentifier {
    pub group: String,
    pub stream: String,
    pub shard_id: String,
}

impl CheckpointIdentifier {
    pub fn key(&self) -> String {
        format!("{}/{}/{}", self.group, self.stream, self.shard_id)
    }
}

/// Storage for per-shard consumer progress.
///
/// Implementations must tolerate concurrent `set` calls from workers of
/// the same group; the keys are distinct per shard so per-key
/// linearizability suffices.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    /// Latest acknowledged sequence number for `key`, or `None` when no
    /// checkpoint exists yet.
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError>;

    /// Record `sequence` as the latest acknowledged position for `key`.
    async fn set(&self, key: &str, sequence: &str) -> Result<(), CheckpointError>;
}
