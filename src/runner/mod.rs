//! The per-shard worker: owns one shard iterator, fetches records in a
//! paced loop, delivers them to the application handler and advances the
//! checkpoint.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::error::{ConsumerError, Result};
use crate::interface::checkpoint::{Checkpoint, CheckpointIdentifier};
use crate::interface::client::{IteratorPosition, StreamClient, StreamRecord};
use crate::interface::handler::{Message, MessageHandler};
use crate::logger::{LogLevel, Logger};
use crate::options::{CheckpointStrategy, ConsumerOptions, StartingPosition};
use crate::supervisor::ShutdownSignal;

/// Lifecycle of a single shard worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    /// No iterator acquired yet.
    Idle,
    /// Steady state; transient failures do not leave it.
    Running,
    /// The final fetch reported the shard closed; its last records are
    /// still being delivered.
    Draining,
    /// Fully drained. Terminal.
    Closed,
    /// A protocol error ended the worker. The coordinator restarts it
    /// from the last checkpoint.
    Failed,
}

/// Invoked once when the worker observes shard closure, so the
/// coordinator can activate the shard's children.
pub(crate) type ClosedFn = Box<dyn Fn() + Send + Sync>;

pub(crate) struct ShardRunner {
    client: Arc<dyn StreamClient>,
    checkpoint: Arc<dyn Checkpoint>,
    handler: MessageHandler,
    id: CheckpointIdentifier,
    tick: Duration,
    checkpoint_strategy: CheckpointStrategy,
    starting_position: StartingPosition,
    on_closed: ClosedFn,
    logger: Logger,
    iterator: Option<String>,
    last_ack: Option<String>,
    status: RunnerStatus,
}

impl ShardRunner {
    pub(crate) fn new(
        client: Arc<dyn StreamClient>,
        checkpoint: Arc<dyn Checkpoint>,
        handler: MessageHandler,
        id: CheckpointIdentifier,
        options: &ConsumerOptions,
        starting_position: StartingPosition,
        on_closed: ClosedFn,
    ) -> Self {
        ShardRunner {
            client,
            checkpoint,
            handler,
            id,
            tick: options.tick,
            checkpoint_strategy: options.checkpoint_strategy,
            starting_position,
            on_closed,
            logger: options.logger.clone().unwrap_or_else(crate::logger::noop),
            iterator: None,
            last_ack: None,
            status: RunnerStatus::Idle,
        }
    }

    pub(crate) fn status(&self) -> RunnerStatus {
        self.status
    }

    /// Latest sequence number successfully written to the checkpoint
    /// store by this worker.
    pub(crate) fn last_ack(&self) -> Option<&str> {
        self.last_ack.as_deref()
    }

    /// Drive the shard until it closes, fails on a protocol error, or
    /// `stop` fires. The in-flight handler call always completes; the
    /// inter-tick sleep wakes on `stop`.
    pub(crate) async fn run(mut self, stop: ShutdownSignal) -> RunnerStatus {
        while !stop.is_triggered() {
            tokio::select! {
                _ = stop.triggered() => break,
                result = self.process() => {
                    if let Err(err) = result {
                        self.status = RunnerStatus::Failed;
                        self.log(LogLevel::Error, &format!("shard worker failed: {err}"));
                        break;
                    }
                    if self.status == RunnerStatus::Closed {
                        break;
                    }
                }
            }
            if stop.is_triggered() {
                break;
            }
            tokio::select! {
                _ = stop.triggered() => {}
                _ = sleep(self.tick) => {}
            }
        }
        self.status
    }

    /// One fetch-and-dispatch cycle.
    ///
    /// Transient failures (checkpoint reads and writes, iterator
    /// acquisition, record fetches, handler errors and panics) are
    /// logged and swallowed so the tick cadence doubles as the retry
    /// cadence. Only protocol errors escape.
    pub(crate) async fn process(&mut self) -> Result<()> {
        let iterator = match &self.iterator {
            Some(iterator) => iterator.clone(),
            None => match self.acquire_iterator().await? {
                Some(iterator) => iterator,
                None => return Ok(()),
            },
        };

        let batch = match self.client.get_records(&iterator).await {
            Ok(batch) => batch,
            Err(err) if err.is_transient() => {
                self.log(LogLevel::Error, &format!("fetching records failed: {err}"));
                // Drop the iterator; the next tick re-resolves from the
                // checkpoint. Also covers iterator expiry.
                self.iterator = None;
                return Ok(());
            }
            Err(err) => return Err(ConsumerError::Protocol(err.to_string())),
        };

        if let Some(behind) = batch.millis_behind_latest {
            self.log(
                LogLevel::Debug,
                &format!("fetched {} record(s), {behind}ms behind latest", batch.records.len()),
            );
        }

        let closing = batch.next_iterator.is_none();
        if closing {
            self.status = RunnerStatus::Draining;
        }

        if !self.dispatch(batch.records).await {
            // Keep the current iterator so the failed record is
            // refetched; the checkpoint was not advanced past it.
            self.status = RunnerStatus::Running;
            self.iterator = Some(iterator);
            return Ok(());
        }

        if closing {
            self.status = RunnerStatus::Closed;
            self.iterator = None;
            self.log(LogLevel::Info, "shard closed and fully consumed");
            (self.on_closed)();
            return Ok(());
        }

        self.iterator = batch.next_iterator;
        Ok(())
    }

    /// Resolve the read position and acquire an iterator. `Ok(None)`
    /// means a transient failure was logged; retry next tick.
    async fn acquire_iterator(&mut self) -> Result<Option<String>> {
        let sequence = match self.checkpoint.get(&self.id.key()).await {
            Ok(sequence) => sequence.filter(|s| !s.is_empty()),
            Err(err) => {
                self.log(LogLevel::Error, &format!("reading checkpoint failed: {err}"));
                return Ok(None);
            }
        };

        let position = match sequence {
            Some(sequence) => IteratorPosition::AfterSequenceNumber(sequence),
            None => match self.starting_position.clone() {
                StartingPosition::TrimHorizon => IteratorPosition::TrimHorizon,
                StartingPosition::Latest => IteratorPosition::Latest,
                StartingPosition::AfterSequenceNumber(sequence) => {
                    IteratorPosition::AfterSequenceNumber(sequence)
                }
            },
        };

        match self
            .client
            .get_shard_iterator(&self.id.stream, &self.id.shard_id, position)
            .await
        {
            Ok(iterator) => {
                if self.status == RunnerStatus::Idle {
                    self.status = RunnerStatus::Running;
                }
                self.iterator = Some(iterator.clone());
                Ok(Some(iterator))
            }
            Err(err) if err.is_transient() => {
                self.log(LogLevel::Error, &format!("acquiring shard iterator failed: {err}"));
                Ok(None)
            }
            Err(err) => Err(ConsumerError::Protocol(err.to_string())),
        }
    }

    /// Deliver `records` in order. Returns false when a handler error or
    /// panic stopped the batch early.
    async fn dispatch(&mut self, records: Vec<StreamRecord>) -> bool {
        let mut last_delivered: Option<String> = None;
        for record in records {
            let sequence = record.sequence_number.clone();
            let message = Message {
                partition_key: record.partition_key,
                data: record.data,
                sequence_number: record.sequence_number,
                shard_id: self.id.shard_id.clone(),
                timestamp: record.timestamp,
            };

            if let Err(reason) = self.deliver(message) {
                self.log(
                    LogLevel::Error,
                    &format!("handler refused record {sequence}: {reason}"),
                );
                return false;
            }

            if self.checkpoint_strategy == CheckpointStrategy::AfterRecord {
                self.acknowledge(&sequence).await;
            }
            last_delivered = Some(sequence);
        }

        if self.checkpoint_strategy == CheckpointStrategy::AfterRecordBatch {
            if let Some(sequence) = last_delivered {
                self.acknowledge(&sequence).await;
            }
        }
        true
    }

    /// Guarded handler invocation: errors and panics both surface as a
    /// refusal, never out of the worker.
    fn deliver(&self, message: Message) -> std::result::Result<(), String> {
        let handler = self.handler.clone();
        match catch_unwind(AssertUnwindSafe(move || handler(message))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(panic) => Err(panic_reason(panic)),
        }
    }

    async fn acknowledge(&mut self, sequence: &str) {
        match self.checkpoint.set(&self.id.key(), sequence).await {
            Ok(()) => self.last_ack = Some(sequence.to_owned()),
            Err(err) => {
                // Not fatal; a crash before the next successful write
                // replays from the previous checkpoint.
                self.log(
                    LogLevel::Error,
                    &format!("writing checkpoint at {sequence} failed: {err}"),
                );
            }
        }
    }

    fn log(&self, level: LogLevel, message: &str) {
        (self.logger)(
            level,
            &[
                ("group", self.id.group.as_str()),
                ("stream", self.id.stream.as_str()),
                ("shard", self.id.shard_id.as_str()),
            ],
            message,
        );
    }
}

fn panic_reason(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_owned()
    }
}
