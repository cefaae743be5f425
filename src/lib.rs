//! Checkpointed, resharding-aware consumer for AWS Kinesis streams.
//!
//! The consumer discovers the shards of a stream, runs one worker per
//! shard, delivers records to an application handler in per-shard order
//! and records progress in a pluggable checkpoint store, so a restarted
//! process resumes where it left off (at-least-once). When shards are
//! split or merged, parent shards are drained before their children
//! start, preserving logical order across the topology change.
//!
//! The per-shard loop is deliberately unkillable by data: handler errors
//! and panics, transient API failures and checkpoint hiccups are logged
//! and retried on the next tick. Only cancellation, shard closure or a
//! malformed service reply end a worker.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use kinesis_consumer::{
//!     Consumer, ConsumerConfig, ConsumerOptions, MemoryCheckpoint, Message,
//!     MessageHandler, ShutdownSignal,
//! };
//!
//! #[tokio::main]
//! async fn main() -> kinesis_consumer::Result<()> {
//!     let config = ConsumerConfig {
//!         group: "indexer".to_owned(),
//!         stream: "events".to_owned(),
//!         ..Default::default()
//!     };
//!     let handler: MessageHandler = Arc::new(|message: Message| {
//!         println!("{}", String::from_utf8_lossy(&message.data));
//!         Ok(())
//!     });
//!     let consumer = Consumer::new(
//!         config,
//!         handler,
//!         Arc::new(MemoryCheckpoint::new()),
//!         ConsumerOptions::default().since_oldest(),
//!     )?;
//!     consumer.run(ShutdownSignal::new()).await
//! }
//! ```

use std::sync::Arc;

pub mod checkpoint;
pub mod client;
mod config;
mod coordinator;
mod error;
pub mod interface;
mod logger;
mod options;
mod runner;
pub mod supervisor;

pub use checkpoint::memory::MemoryCheckpoint;
pub use client::kinesis::KinesisStreamClient;
pub use config::{AwsConfig, ConsumerConfig};
pub use error::{CheckpointError, ClientError, ConsumerError, Result};
pub use interface::checkpoint::{Checkpoint, CheckpointIdentifier};
pub use interface::client::{IteratorPosition, RecordBatch, Shard, StreamClient, StreamRecord};
pub use interface::handler::{HandlerError, Message, MessageHandler};
pub use logger::{LogFields, LogLevel, Logger};
pub use options::{CheckpointStrategy, ConsumerOptions, StartingPosition, DEFAULT_TICK};
pub use runner::RunnerStatus;
pub use supervisor::{ShutdownSignal, Supervisor};

use coordinator::{Coordinator, SHARD_DISCOVERY_INTERVAL};

/// A consumer of one stream on behalf of one group.
///
/// Construction validates the configuration; [`run`](Consumer::run)
/// does the work.
pub struct Consumer {
    config: ConsumerConfig,
    options: ConsumerOptions,
    handler: MessageHandler,
    checkpoint: Arc<dyn Checkpoint>,
    client: Arc<dyn StreamClient>,
    shutdown: ShutdownSignal,
}

impl Consumer {
    /// Build a consumer talking to the endpoint/region named in
    /// `config.aws`.
    pub fn new(
        config: ConsumerConfig,
        handler: MessageHandler,
        checkpoint: Arc<dyn Checkpoint>,
        options: ConsumerOptions,
    ) -> Result<Self> {
        let client = Arc::new(KinesisStreamClient::new(&config.aws)?);
        Consumer::with_client(config, handler, checkpoint, options, client)
    }

    /// Build a consumer over a caller-supplied stream client. Useful
    /// for alternative transports and for tests.
    pub fn with_client(
        config: ConsumerConfig,
        handler: MessageHandler,
        checkpoint: Arc<dyn Checkpoint>,
        options: ConsumerOptions,
        client: Arc<dyn StreamClient>,
    ) -> Result<Self> {
        if config.group.is_empty() {
            return Err(ConsumerError::Config(
                "consumer group must not be empty".to_owned(),
            ));
        }
        if config.stream.is_empty() {
            return Err(ConsumerError::Config(
                "stream name must not be empty".to_owned(),
            ));
        }
        Ok(Consumer {
            config,
            options,
            handler,
            checkpoint,
            client,
            shutdown: ShutdownSignal::new(),
        })
    }

    /// Consume until `stop` fires or [`shutdown`](Consumer::shutdown)
    /// is called. Blocks for the lifetime of the consumer and returns
    /// the first fatal error, if any.
    pub async fn run(&self, stop: ShutdownSignal) -> Result<()> {
        {
            let external = stop.clone();
            let internal = self.shutdown.clone();
            tokio::spawn(async move {
                external.triggered().await;
                internal.trigger();
            });
        }

        let coordinator = Coordinator::new(
            self.client.clone(),
            self.checkpoint.clone(),
            self.handler.clone(),
            self.config.clone(),
            self.options.clone(),
            SHARD_DISCOVERY_INTERVAL,
        );
        coordinator.run(self.shutdown.clone()).await
    }

    /// Request shutdown of a running consumer.
    pub fn shutdown(&self) {
        self.shutdown.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    struct NullClient;

    #[async_trait]
    impl StreamClient for NullClient {
        async fn list_shards(&self, _stream: &str) -> std::result::Result<Vec<Shard>, ClientError> {
            Ok(Vec::new())
        }

        async fn get_shard_iterator(
            &self,
            _stream: &str,
            _shard_id: &str,
            _position: IteratorPosition,
        ) -> std::result::Result<String, ClientError> {
            Err(ClientError::Transient("unused".to_owned()))
        }

        async fn get_records(
            &self,
            _iterator: &str,
        ) -> std::result::Result<RecordBatch, ClientError> {
            Err(ClientError::Transient("unused".to_owned()))
        }
    }

    fn noop_handler() -> MessageHandler {
        Arc::new(|_message: Message| Ok(()))
    }

    fn consumer_with(group: &str, stream: &str) -> Result<Consumer> {
        Consumer::with_client(
            ConsumerConfig {
                group: group.to_owned(),
                stream: stream.to_owned(),
                aws: Default::default(),
            },
            noop_handler(),
            Arc::new(MemoryCheckpoint::new()),
            ConsumerOptions::default(),
            Arc::new(NullClient),
        )
    }

    #[test]
    fn construction_rejects_empty_group() {
        assert!(matches!(
            consumer_with("", "some_stream"),
            Err(ConsumerError::Config(_))
        ));
    }

    #[test]
    fn construction_rejects_empty_stream() {
        assert!(matches!(
            consumer_with("some_group", ""),
            Err(ConsumerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn shutdown_ends_a_running_consumer() {
        let consumer = Arc::new(consumer_with("some_group", "some_stream").unwrap());
        let task = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(ShutdownSignal::new()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        consumer.shutdown();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("consumer did not stop")
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn external_signal_ends_a_running_consumer() {
        let consumer = Arc::new(consumer_with("some_group", "some_stream").unwrap());
        let stop = ShutdownSignal::new();
        let task = {
            let consumer = consumer.clone();
            let stop = stop.clone();
            tokio::spawn(async move { consumer.run(stop).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stop.trigger();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), task)
            .await
            .expect("consumer did not stop")
            .unwrap();
        assert!(result.is_ok());
    }
}
