use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::CheckpointError;
use crate::interface::checkpoint::Checkpoint;

/// Process-local checkpoint store.
///
/// Progress is lost when the process exits, which makes this suitable
/// for tooling and tests but not for consumers that must survive
/// restarts.
#[derive(Debug, Default)]
pub struct MemoryCheckpoint {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryCheckpoint {
    pub fn new() -> Self {
        MemoryCheckpoint::default()
    }
}

#[async_trait]
impl Checkpoint for MemoryCheckpoint {
    async fn get(&self, key: &str) -> Result<Option<String>, CheckpointError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, sequence: &str) -> Result<(), CheckpointError> {
        self.entries
            .write()
            .await
            .insert(key.to_owned(), sequence.to_owned());
        Ok(())
    }
}
