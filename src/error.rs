use thiserror::Error;

/// Result alias for consumer operations.
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Errors surfaced to the caller of the library.
///
/// Transient stream and checkpoint failures never appear here; the shard
/// workers log them and retry on the next tick.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The consumer was constructed with an unusable configuration.
    #[error("invalid consumer configuration: {0}")]
    Config(String),

    /// The stream service replied with something the client cannot
    /// interpret. Unlike transient failures these are reported, not
    /// silently retried.
    #[error("stream protocol error: {0}")]
    Protocol(String),
}

/// Error returned by a [`StreamClient`](crate::StreamClient)
/// implementation, classified at the client boundary.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network trouble, throttling, expired iterators, 5xx replies.
    /// Retried by the worker loop on its next tick.
    #[error("transient stream error: {0}")]
    Transient(String),

    /// A reply that violates the expected shape, for example a missing
    /// shard iterator. Never retried blindly.
    #[error("malformed stream response: {0}")]
    Protocol(String),
}

impl ClientError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ClientError::Transient(_))
    }
}

/// Error returned by a [`Checkpoint`](crate::Checkpoint) backend.
///
/// Checkpoint failures are always treated as transient by the consumer:
/// they are logged and the operation is retried implicitly.
#[derive(Debug, Error)]
#[error("checkpoint store error: {0}")]
pub struct CheckpointError(Box<dyn std::error::Error + Send + Sync>);

impl CheckpointError {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        CheckpointError(source.into())
    }
}
