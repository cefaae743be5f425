use std::time::Duration;

use crate::logger::Logger;

/// Default inter-poll interval per shard.
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

/// When the consumer acknowledges progress to the checkpoint store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointStrategy {
    /// Write a checkpoint after every successfully handled record.
    AfterRecord,
    /// Write a checkpoint once per batch, after its last successfully
    /// handled record. A mid-batch failure writes nothing.
    #[default]
    AfterRecordBatch,
    /// The handler owns checkpointing; the consumer never writes. A
    /// handler that never checkpoints will replay from the starting
    /// position on every restart.
    Manual,
}

/// Where a shard worker begins when no checkpoint exists. An existing
/// checkpoint always wins over the policy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StartingPosition {
    /// Oldest record still retained in the shard.
    TrimHorizon,
    /// The next record to arrive.
    #[default]
    Latest,
    /// The record immediately after the given sequence number.
    AfterSequenceNumber(String),
}

/// Tunable behavior of a [`Consumer`](crate::Consumer).
///
/// The fields enumerate every recognized option with its default; the
/// builder methods exist for call-site convenience.
#[derive(Clone)]
pub struct ConsumerOptions {
    pub checkpoint_strategy: CheckpointStrategy,
    pub starting_position: StartingPosition,
    pub skip_resharding_order: bool,
    pub tick: Duration,
    pub logger: Option<Logger>,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        ConsumerOptions {
            checkpoint_strategy: CheckpointStrategy::default(),
            starting_position: StartingPosition::default(),
            skip_resharding_order: false,
            tick: DEFAULT_TICK,
            logger: None,
        }
    }
}

impl ConsumerOptions {
    pub fn with_checkpoint_strategy(mut self, strategy: CheckpointStrategy) -> Self {
        self.checkpoint_strategy = strategy;
        self
    }

    /// Begin at the next arriving record when no checkpoint exists.
    pub fn since_latest(mut self) -> Self {
        self.starting_position = StartingPosition::Latest;
        self
    }

    /// Begin at the oldest available record when no checkpoint exists.
    pub fn since_oldest(mut self) -> Self {
        self.starting_position = StartingPosition::TrimHorizon;
        self
    }

    /// Begin after the given sequence number when no checkpoint exists.
    pub fn since_sequence(mut self, sequence: impl Into<String>) -> Self {
        self.starting_position = StartingPosition::AfterSequenceNumber(sequence.into());
        self
    }

    /// Start child shards immediately alongside their parents instead of
    /// waiting for the parents to drain. Per-shard order still holds;
    /// parent-to-child order does not.
    pub fn skip_resharding_order(mut self) -> Self {
        self.skip_resharding_order = true;
        self
    }

    /// Inter-poll interval per shard.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Install a structured logger callback.
    pub fn with_logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }
}
