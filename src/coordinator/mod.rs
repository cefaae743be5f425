//! Translates a stream's shard topology into a live set of shard
//! workers: discovery, resharding order, restarts and graceful shutdown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::ConsumerConfig;
use crate::error::Result;
use crate::interface::checkpoint::{Checkpoint, CheckpointIdentifier};
use crate::interface::client::StreamClient;
use crate::interface::handler::MessageHandler;
use crate::logger::{LogLevel, Logger};
use crate::options::{ConsumerOptions, StartingPosition};
use crate::runner::{RunnerStatus, ShardRunner};
use crate::supervisor::ShutdownSignal;

/// How often the shard listing is refreshed to catch resharding that
/// happened while every known shard was quiet.
pub(crate) const SHARD_DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

enum Event {
    /// A worker drained its shard to the end.
    ShardClosed(String),
}

/// A shard we know about and its resharding lineage.
struct ShardNode {
    parents: Vec<String>,
}

struct RunnerHandle {
    stop: ShutdownSignal,
    task: JoinHandle<RunnerStatus>,
}

pub(crate) struct Coordinator {
    client: Arc<dyn StreamClient>,
    checkpoint: Arc<dyn Checkpoint>,
    handler: MessageHandler,
    config: ConsumerConfig,
    options: ConsumerOptions,
    logger: Logger,
    discovery_interval: Duration,

    shards: HashMap<String, ShardNode>,
    runners: HashMap<String, RunnerHandle>,
    /// Shards drained to the end by our own workers.
    closed: HashSet<String>,
    /// Child shard -> parents it is still waiting on.
    pending: HashMap<String, HashSet<String>>,

    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: Option<mpsc::UnboundedReceiver<Event>>,
}

impl Coordinator {
    pub(crate) fn new(
        client: Arc<dyn StreamClient>,
        checkpoint: Arc<dyn Checkpoint>,
        handler: MessageHandler,
        config: ConsumerConfig,
        options: ConsumerOptions,
        discovery_interval: Duration,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let logger = options.logger.clone().unwrap_or_else(crate::logger::noop);
        Coordinator {
            client,
            checkpoint,
            handler,
            config,
            options,
            logger,
            discovery_interval,
            shards: HashMap::new(),
            runners: HashMap::new(),
            closed: HashSet::new(),
            pending: HashMap::new(),
            events_tx,
            events_rx: Some(events_rx),
        }
    }

    /// Drive discovery and worker lifecycle until `stop` fires, then
    /// shut every worker down and join it.
    pub(crate) async fn run(mut self, stop: ShutdownSignal) -> Result<()> {
        let mut events = self.events_rx.take().expect("coordinator can only run once");

        let mut discovery = tokio::time::interval(self.discovery_interval);
        discovery.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.log(LogLevel::Info, "consumer started");
        loop {
            tokio::select! {
                // Closure events outrank discovery: a finished worker
                // whose event is still queued must not be mistaken for
                // a failed one.
                biased;
                _ = stop.triggered() => break,
                Some(event) = events.recv() => self.handle_event(event),
                // First tick fires immediately and doubles as the
                // initial discovery.
                _ = discovery.tick() => self.discover().await,
            }
        }

        self.shutdown_runners().await;
        self.log(LogLevel::Info, "consumer stopped");
        Ok(())
    }

    /// Reconcile the worker set against the current shard listing.
    async fn discover(&mut self) {
        let listed = match self.client.list_shards(&self.config.stream).await {
            Ok(listed) => listed,
            Err(err) => {
                self.log(LogLevel::Error, &format!("listing shards failed: {err}"));
                return;
            }
        };

        let listed_ids: HashSet<String> = listed.iter().map(|s| s.id.clone()).collect();
        for shard in listed {
            self.shards
                .entry(shard.id.clone())
                .or_insert(ShardNode {
                    parents: shard.parent_ids,
                });
            self.evaluate(&shard.id, &listed_ids);
        }
    }

    /// Start, queue or restart the worker for one listed shard.
    fn evaluate(&mut self, shard_id: &str, listed: &HashSet<String>) {
        if self.closed.contains(shard_id) {
            return;
        }

        if let Some(handle) = self.runners.get(shard_id) {
            if !handle.task.is_finished() {
                return;
            }
            // The worker ended without reporting closure, i.e. it
            // failed. Recreate it; it resumes from its checkpoint.
            self.runners.remove(shard_id);
            self.log(
                LogLevel::Info,
                &format!("restarting failed worker for shard {shard_id}"),
            );
        }

        let node = &self.shards[shard_id];
        // A parent still matters while the stream retains it and we have
        // not drained it ourselves.
        let outstanding: HashSet<String> = node
            .parents
            .iter()
            .filter(|p| listed.contains(*p) && !self.closed.contains(*p))
            .cloned()
            .collect();

        if outstanding.is_empty() || self.options.skip_resharding_order {
            self.pending.remove(shard_id);
            let position = self.position_for(shard_id, listed);
            self.spawn_runner(shard_id.to_owned(), position);
        } else {
            self.pending.insert(shard_id.to_owned(), outstanding);
        }
    }

    /// Children begin at the trim horizon so no record between the
    /// parent's end and the configured policy is skipped; shards whose
    /// recorded parents have aged out of the stream count as roots.
    fn position_for(&self, shard_id: &str, listed: &HashSet<String>) -> StartingPosition {
        let node = &self.shards[shard_id];
        let is_child = node
            .parents
            .iter()
            .any(|p| listed.contains(p) || self.closed.contains(p));
        if is_child {
            StartingPosition::TrimHorizon
        } else {
            self.options.starting_position.clone()
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ShardClosed(shard_id) => {
                self.log(
                    LogLevel::Info,
                    &format!("shard {shard_id} fully consumed"),
                );
                self.closed.insert(shard_id.clone());
                // The worker task is finishing on its own; dropping the
                // handle detaches it.
                self.runners.remove(&shard_id);
                self.activate_children_of(&shard_id);
            }
        }
    }

    /// Start every pending child whose last outstanding parent just
    /// closed. Merge children wait for both parents.
    fn activate_children_of(&mut self, parent_id: &str) {
        let mut ready = Vec::new();
        for (child, outstanding) in self.pending.iter_mut() {
            outstanding.remove(parent_id);
            if outstanding.is_empty() {
                ready.push(child.clone());
            }
        }
        for child in ready {
            self.pending.remove(&child);
            self.spawn_runner(child, StartingPosition::TrimHorizon);
        }
    }

    fn spawn_runner(&mut self, shard_id: String, position: StartingPosition) {
        // One worker per shard, ever, per coordinator.
        if self.runners.contains_key(&shard_id) {
            return;
        }

        let on_closed = {
            let events = self.events_tx.clone();
            let shard_id = shard_id.clone();
            Box::new(move || {
                let _ = events.send(Event::ShardClosed(shard_id.clone()));
            })
        };
        let runner = ShardRunner::new(
            self.client.clone(),
            self.checkpoint.clone(),
            self.handler.clone(),
            CheckpointIdentifier {
                group: self.config.group.clone(),
                stream: self.config.stream.clone(),
                shard_id: shard_id.clone(),
            },
            &self.options,
            position,
            on_closed,
        );

        self.log(LogLevel::Info, &format!("starting worker for shard {shard_id}"));
        let stop = ShutdownSignal::new();
        let task = tokio::spawn(runner.run(stop.clone()));
        self.runners.insert(shard_id, RunnerHandle { stop, task });
    }

    /// Cooperative stop: every worker finishes its in-flight dispatch
    /// before its task returns.
    async fn shutdown_runners(&mut self) {
        for handle in self.runners.values() {
            handle.stop.trigger();
        }
        let tasks: Vec<JoinHandle<RunnerStatus>> =
            self.runners.drain().map(|(_, handle)| handle.task).collect();
        join_all(tasks).await;
    }

    fn log(&self, level: LogLevel, message: &str) {
        (self.logger)(
            level,
            &[
                ("group", self.config.group.as_str()),
                ("stream", self.config.stream.as_str()),
            ],
            message,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::error::ClientError;
    use crate::interface::client::{IteratorPosition, RecordBatch, Shard, StreamRecord};
    use crate::interface::handler::Message;

    /// Scripted stream: a mutable shard listing plus per-shard queues of
    /// fetch replies. An exhausted open shard idles on empty batches.
    #[derive(Default)]
    struct TopologyClient {
        shards: Mutex<Vec<Shard>>,
        batches: Mutex<HashMap<String, VecDeque<RecordBatch>>>,
        iterator_requests: Mutex<Vec<(String, IteratorPosition)>>,
    }

    impl TopologyClient {
        fn shard(self, id: &str, parents: &[&str]) -> Self {
            self.shards.lock().unwrap().push(Shard {
                id: id.to_owned(),
                parent_ids: parents.iter().map(|p| p.to_string()).collect(),
            });
            self
        }

        fn batch(self, shard_id: &str, sequences: &[&str], closes: bool) -> Self {
            let next_iterator = if closes {
                None
            } else {
                Some(iterator_for(shard_id))
            };
            self.batches
                .lock()
                .unwrap()
                .entry(shard_id.to_owned())
                .or_default()
                .push_back(RecordBatch {
                    records: sequences
                        .iter()
                        .map(|s| StreamRecord {
                            partition_key: "some_partition".to_owned(),
                            data: Bytes::from_static(b"some_data"),
                            sequence_number: s.to_string(),
                            timestamp: None,
                        })
                        .collect(),
                    next_iterator,
                    millis_behind_latest: Some(0),
                });
            self
        }

        fn failing_batch(self, shard_id: &str) -> Self {
            // A queue entry with a poisoned marker: represented as a
            // batch whose single record carries the sentinel sequence;
            // see get_records below.
            self.batches
                .lock()
                .unwrap()
                .entry(shard_id.to_owned())
                .or_default()
                .push_back(RecordBatch {
                    records: vec![StreamRecord {
                        partition_key: String::new(),
                        data: Bytes::new(),
                        sequence_number: PROTOCOL_FAILURE.to_owned(),
                        timestamp: None,
                    }],
                    next_iterator: Some(iterator_for(shard_id)),
                    millis_behind_latest: None,
                });
            self
        }

        fn add_shard(&self, id: &str, parents: &[&str]) {
            self.shards.lock().unwrap().push(Shard {
                id: id.to_owned(),
                parent_ids: parents.iter().map(|p| p.to_string()).collect(),
            });
        }
    }

    const PROTOCOL_FAILURE: &str = "__protocol_failure__";

    fn iterator_for(shard_id: &str) -> String {
        format!("{shard_id}::iterator")
    }

    fn shard_of(iterator: &str) -> String {
        iterator.split("::").next().unwrap_or_default().to_owned()
    }

    #[async_trait]
    impl StreamClient for TopologyClient {
        async fn list_shards(&self, _stream: &str) -> std::result::Result<Vec<Shard>, ClientError> {
            Ok(self.shards.lock().unwrap().clone())
        }

        async fn get_shard_iterator(
            &self,
            _stream: &str,
            shard_id: &str,
            position: IteratorPosition,
        ) -> std::result::Result<String, ClientError> {
            self.iterator_requests
                .lock()
                .unwrap()
                .push((shard_id.to_owned(), position));
            Ok(iterator_for(shard_id))
        }

        async fn get_records(&self, iterator: &str) -> std::result::Result<RecordBatch, ClientError> {
            let shard_id = shard_of(iterator);
            let next = self
                .batches
                .lock()
                .unwrap()
                .get_mut(&shard_id)
                .and_then(|queue| queue.pop_front());
            match next {
                Some(batch)
                    if batch
                        .records
                        .first()
                        .is_some_and(|r| r.sequence_number == PROTOCOL_FAILURE) =>
                {
                    Err(ClientError::Protocol("garbled reply".to_owned()))
                }
                Some(batch) => Ok(batch),
                // Open shard with nothing new.
                None => Ok(RecordBatch {
                    records: Vec::new(),
                    next_iterator: Some(iterator.to_owned()),
                    millis_behind_latest: Some(0),
                }),
            }
        }
    }

    struct Harness {
        client: Arc<TopologyClient>,
        delivered: Arc<Mutex<Vec<(String, String)>>>,
        stop: ShutdownSignal,
        task: JoinHandle<Result<()>>,
    }

    impl Harness {
        fn start(client: TopologyClient, options: ConsumerOptions) -> Self {
            let client = Arc::new(client);
            let delivered = Arc::new(Mutex::new(Vec::new()));
            let sink = delivered.clone();
            let handler: MessageHandler = Arc::new(move |message: Message| {
                sink.lock()
                    .unwrap()
                    .push((message.shard_id, message.sequence_number));
                Ok(())
            });
            let coordinator = Coordinator::new(
                client.clone(),
                Arc::new(crate::checkpoint::memory::MemoryCheckpoint::new()),
                handler,
                ConsumerConfig {
                    group: "some_group".to_owned(),
                    stream: "some_stream".to_owned(),
                    aws: Default::default(),
                },
                options.with_tick(Duration::from_millis(10)),
                Duration::from_millis(20),
            );
            let stop = ShutdownSignal::new();
            let task = tokio::spawn(coordinator.run(stop.clone()));
            Harness {
                client,
                delivered,
                stop,
                task,
            }
        }

        fn sequences(&self) -> Vec<String> {
            self.delivered
                .lock()
                .unwrap()
                .iter()
                .map(|(_, sequence)| sequence.clone())
                .collect()
        }

        async fn wait_for_count(&self, count: usize) {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
            while self.delivered.lock().unwrap().len() < count {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "timed out waiting for {count} deliveries, saw {:?}",
                    self.delivered.lock().unwrap()
                );
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn stop(self) -> Result<()> {
            self.stop.trigger();
            tokio::time::timeout(Duration::from_secs(5), self.task)
                .await
                .expect("coordinator did not stop")
                .unwrap()
        }
    }

    #[tokio::test]
    async fn parent_records_are_delivered_before_child_records() {
        let client = TopologyClient::default()
            .shard("shardId-0000", &[])
            .shard("shardId-0001", &["shardId-0000"])
            .batch("shardId-0000", &["p-1", "p-2"], true)
            .batch("shardId-0001", &["c-1"], true);

        let harness = Harness::start(client, ConsumerOptions::default());
        harness.wait_for_count(3).await;

        assert_eq!(harness.sequences(), ["p-1", "p-2", "c-1"]);
        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn child_starts_at_trim_horizon_after_parent_closes() {
        let client = TopologyClient::default()
            .shard("shardId-0000", &[])
            .shard("shardId-0001", &["shardId-0000"])
            .batch("shardId-0000", &[], true)
            .batch("shardId-0001", &["c-1"], true);

        let harness = Harness::start(client, ConsumerOptions::default().since_latest());
        harness.wait_for_count(1).await;

        let requests = harness.client.iterator_requests.lock().unwrap().clone();
        assert!(requests.contains(&(
            "shardId-0000".to_owned(),
            IteratorPosition::Latest,
        )));
        assert!(requests.contains(&(
            "shardId-0001".to_owned(),
            IteratorPosition::TrimHorizon,
        )));
        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn merge_child_waits_for_both_parents() {
        // shardId-0000 closes immediately; shardId-0001 needs a second
        // tick. The merge child must trail the slower parent.
        let client = TopologyClient::default()
            .shard("shardId-0000", &[])
            .shard("shardId-0001", &[])
            .shard("shardId-0002", &["shardId-0000", "shardId-0001"])
            .batch("shardId-0000", &["a-1"], true)
            .batch("shardId-0001", &["b-1"], false)
            .batch("shardId-0001", &["b-2"], true)
            .batch("shardId-0002", &["m-1"], true);

        let harness = Harness::start(client, ConsumerOptions::default());
        harness.wait_for_count(4).await;

        let sequences = harness.sequences();
        let position = |sequence: &str| {
            sequences
                .iter()
                .position(|s| s == sequence)
                .unwrap_or_else(|| panic!("{sequence} not delivered"))
        };
        assert!(position("m-1") > position("a-1"));
        assert!(position("m-1") > position("b-2"));
        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn skip_resharding_order_starts_children_alongside_parents() {
        // The parent never closes; without the option the child would
        // wait forever.
        let client = TopologyClient::default()
            .shard("shardId-0000", &[])
            .shard("shardId-0001", &["shardId-0000"])
            .batch("shardId-0000", &["p-1"], false)
            .batch("shardId-0001", &["c-1"], false);

        let harness = Harness::start(client, ConsumerOptions::default().skip_resharding_order());
        harness.wait_for_count(2).await;

        let sequences = harness.sequences();
        assert!(sequences.contains(&"c-1".to_owned()));
        let requests = harness.client.iterator_requests.lock().unwrap().clone();
        assert!(requests.contains(&(
            "shardId-0001".to_owned(),
            IteratorPosition::TrimHorizon,
        )));
        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn rediscovery_picks_up_shards_created_after_start() {
        let client = TopologyClient::default()
            .shard("shardId-0000", &[])
            .batch("shardId-0000", &["p-1"], false)
            .batch("shardId-0001", &["n-1"], false);

        let harness = Harness::start(client, ConsumerOptions::default());
        harness.wait_for_count(1).await;

        harness.client.add_shard("shardId-0001", &[]);
        harness.wait_for_count(2).await;

        assert!(harness.sequences().contains(&"n-1".to_owned()));
        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failed_workers_are_restarted_on_rediscovery() {
        let client = TopologyClient::default()
            .shard("shardId-0000", &[])
            .failing_batch("shardId-0000")
            .batch("shardId-0000", &["p-1"], false);

        let harness = Harness::start(client, ConsumerOptions::default());
        // First worker dies on the garbled reply; rediscovery recreates
        // it and the replacement delivers.
        harness.wait_for_count(1).await;

        assert_eq!(harness.sequences(), ["p-1"]);
        harness.stop().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_all_workers_and_returns() {
        let client = TopologyClient::default()
            .shard("shardId-0000", &[])
            .shard("shardId-0001", &[])
            .batch("shardId-0000", &["a-1"], false)
            .batch("shardId-0001", &["b-1"], false);

        let harness = Harness::start(client, ConsumerOptions::default());
        harness.wait_for_count(2).await;

        harness.stop().await.unwrap();
    }
}
