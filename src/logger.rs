use std::sync::Arc;

/// Severity of a log entry emitted by the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

/// Structured context attached to a log entry, typically the consumer
/// group, stream and shard the entry concerns.
pub type LogFields<'a> = &'a [(&'static str, &'a str)];

/// Callback receiving every log entry the consumer produces.
///
/// The library does not log on its own account; install a logger through
/// [`ConsumerOptions::with_logger`](crate::ConsumerOptions::with_logger)
/// to see what the workers are doing.
pub type Logger = Arc<dyn Fn(LogLevel, LogFields<'_>, &str) + Send + Sync>;

pub(crate) fn noop() -> Logger {
    Arc::new(|_, _, _| {})
}
