//! Shared test utilities for the kafka-split-consumer crate.
//!
//! `MockGroupClient` plays a scripted consumer group so the poll loop and the
//! rebalance coordinator can be exercised without a broker.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use rdkafka::error::KafkaError;
use tokio::sync::Notify;

use crate::broker::{ConsumerGroupClient, Fetches, OffsetCommitter, RebalanceListener};
use crate::error::{ConsumerError, FetchError};
use crate::kafka::types::{PartitionOffset, Record, TopicPartition};
use crate::registry::RecordHandler;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Records every record it handles, optionally slowly or failing on chosen offsets
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<(TopicPartition, i64)>>,
    delay: Option<Duration>,
    failing_offsets: HashSet<i64>,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Return an error for these offsets, after recording them
    pub fn failing_on(offsets: impl IntoIterator<Item = i64>) -> Self {
        Self {
            failing_offsets: offsets.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn offsets_for(&self, partition: &TopicPartition) -> Vec<i64> {
        lock(&self.seen)
            .iter()
            .filter(|(tp, _)| tp == partition)
            .map(|(_, offset)| *offset)
            .collect()
    }

    pub fn total(&self) -> usize {
        lock(&self.seen).len()
    }

    /// Wait until at least `count` records were handled. Returns false on timeout.
    pub async fn wait_for_count(&self, count: usize, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if self.total() >= count {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn handle(&self, record: &Record) -> Result<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        lock(&self.seen).push((record.topic_partition().clone(), record.offset()));
        self.notify.notify_waiters();

        if self.failing_offsets.contains(&record.offset()) {
            anyhow::bail!("simulated failure at offset {}", record.offset());
        }
        Ok(())
    }
}

type CommitSampler = Box<dyn Fn() -> usize + Send + Sync>;

/// An [`OffsetCommitter`] that keeps every commit it receives
#[derive(Default)]
pub struct RecordingCommitter {
    commits: Mutex<Vec<Vec<PartitionOffset>>>,
    fail: bool,
    sampler: Mutex<Option<CommitSampler>>,
    observed: Mutex<Vec<usize>>,
}

impl RecordingCommitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Call `sampler` at the moment of each commit and keep its result
    pub fn on_commit(&self, sampler: impl Fn() -> usize + Send + Sync + 'static) {
        *lock(&self.sampler) = Some(Box::new(sampler));
    }

    pub fn commits(&self) -> Vec<Vec<PartitionOffset>> {
        lock(&self.commits).clone()
    }

    pub fn observed_at_commit(&self) -> Vec<usize> {
        lock(&self.observed).clone()
    }
}

impl OffsetCommitter for RecordingCommitter {
    fn commit_offsets(&self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError> {
        if let Some(sampler) = lock(&self.sampler).as_ref() {
            lock(&self.observed).push(sampler());
        }
        if self.fail {
            return Err(ConsumerError::Commit("simulated commit failure".to_string()));
        }
        lock(&self.commits).push(offsets.to_vec());
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Assigned(Vec<TopicPartition>),
    Revoked(Vec<TopicPartition>),
    Lost(Vec<TopicPartition>),
}

/// A [`RebalanceListener`] that only records what it was told
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<ListenerEvent> {
        lock(&self.events).clone()
    }
}

impl RebalanceListener for RecordingListener {
    fn on_assigned(&self, partitions: &[TopicPartition]) {
        lock(&self.events).push(ListenerEvent::Assigned(partitions.to_vec()));
    }

    fn on_revoked(&self, _committer: &dyn OffsetCommitter, partitions: &[TopicPartition]) {
        lock(&self.events).push(ListenerEvent::Revoked(partitions.to_vec()));
    }

    fn on_lost(&self, partitions: &[TopicPartition]) {
        lock(&self.events).push(ListenerEvent::Lost(partitions.to_vec()));
    }
}

/// One scripted result of `MockGroupClient::poll_records`
#[derive(Debug)]
pub enum MockStep {
    Assign(Vec<TopicPartition>),
    Revoke(Vec<TopicPartition>),
    Lose(Vec<TopicPartition>),
    Records(Vec<Record>),
    Error(FetchError),
}

#[derive(Default)]
struct MockState {
    steps: VecDeque<MockStep>,
    assigned: BTreeSet<TopicPartition>,
    topics: Vec<String>,
    commits: Vec<Vec<PartitionOffset>>,
    dispatch_open: bool,
    rebalance_violations: usize,
    allow_rebalance_count: usize,
    close_count: usize,
    closing: bool,
    closed: bool,
}

/// A scripted consumer-group client.
///
/// Each `poll_records` plays the next step. Rebalance steps invoke the listener
/// on the polling thread, like librdkafka does. Once the script is exhausted a
/// requested close revokes every assigned partition and reports the client
/// closed; otherwise empty fetches are returned.
pub struct MockGroupClient {
    listener: Arc<dyn RebalanceListener>,
    state: Mutex<MockState>,
    fail_commits: AtomicBool,
    fail_subscribe: AtomicBool,
    idle_poll: Duration,
}

impl MockGroupClient {
    pub fn new(listener: Arc<dyn RebalanceListener>) -> Self {
        Self {
            listener,
            state: Mutex::new(MockState::default()),
            fail_commits: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            idle_poll: Duration::from_millis(5),
        }
    }

    pub fn push_step(&self, step: MockStep) {
        lock(&self.state).steps.push_back(step);
    }

    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn commits(&self) -> Vec<Vec<PartitionOffset>> {
        lock(&self.state).commits.clone()
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        lock(&self.state).topics.clone()
    }

    pub fn assigned(&self) -> Vec<TopicPartition> {
        lock(&self.state).assigned.iter().cloned().collect()
    }

    pub fn allow_rebalance_count(&self) -> usize {
        lock(&self.state).allow_rebalance_count
    }

    /// Rebalances delivered while fetched records had not been released yet
    pub fn rebalance_violations(&self) -> usize {
        lock(&self.state).rebalance_violations
    }

    pub fn close_count(&self) -> usize {
        lock(&self.state).close_count
    }

    pub fn remaining_steps(&self) -> usize {
        lock(&self.state).steps.len()
    }

    fn begin_rebalance(&self) {
        let mut state = lock(&self.state);
        if state.dispatch_open {
            state.rebalance_violations += 1;
        }
    }
}

impl OffsetCommitter for MockGroupClient {
    fn commit_offsets(&self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(ConsumerError::Commit("simulated commit failure".to_string()));
        }
        lock(&self.state).commits.push(offsets.to_vec());
        Ok(())
    }
}

impl ConsumerGroupClient for MockGroupClient {
    fn add_consume_topic(&self, topic: &str) -> Result<(), ConsumerError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(ConsumerError::Kafka(KafkaError::Subscription(format!(
                "simulated subscription failure for {topic}"
            ))));
        }
        let mut state = lock(&self.state);
        if !state.topics.iter().any(|t| t == topic) {
            state.topics.push(topic.to_string());
        }
        Ok(())
    }

    fn poll_records(&self, max_records: usize) -> Fetches {
        // The state lock is released before calling the listener, which may commit
        let (step, closing) = {
            let mut state = lock(&self.state);
            if state.closed {
                return Fetches::closed();
            }
            (state.steps.pop_front(), state.closing)
        };

        match step {
            Some(MockStep::Assign(partitions)) => {
                self.begin_rebalance();
                lock(&self.state).assigned.extend(partitions.iter().cloned());
                self.listener.on_assigned(&partitions);
                Fetches::default()
            }
            Some(MockStep::Revoke(partitions)) => {
                self.begin_rebalance();
                self.listener.on_revoked(self, &partitions);
                let mut state = lock(&self.state);
                for p in &partitions {
                    state.assigned.remove(p);
                }
                Fetches::default()
            }
            Some(MockStep::Lose(partitions)) => {
                self.begin_rebalance();
                self.listener.on_lost(&partitions);
                let mut state = lock(&self.state);
                for p in &partitions {
                    state.assigned.remove(p);
                }
                Fetches::default()
            }
            Some(MockStep::Records(mut records)) => {
                let mut state = lock(&self.state);
                if records.len() > max_records {
                    let rest = records.split_off(max_records);
                    state.steps.push_front(MockStep::Records(rest));
                }
                state.dispatch_open = true;
                Fetches::from_records(records)
            }
            Some(MockStep::Error(err)) => Fetches::from_errors(vec![err]),
            None if closing => {
                let partitions = self.assigned();
                if !partitions.is_empty() {
                    self.begin_rebalance();
                    self.listener.on_revoked(self, &partitions);
                }
                let mut state = lock(&self.state);
                state.assigned.clear();
                state.closed = true;
                Fetches::closed()
            }
            None => {
                std::thread::sleep(self.idle_poll);
                Fetches::default()
            }
        }
    }

    fn allow_rebalance(&self) {
        let mut state = lock(&self.state);
        state.dispatch_open = false;
        state.allow_rebalance_count += 1;
    }

    fn close_allowing_rebalance(&self) {
        let mut state = lock(&self.state);
        state.closing = true;
        state.close_count += 1;
    }
}
