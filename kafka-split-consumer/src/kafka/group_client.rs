use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::ClientConfig;
use tracing::{debug, info, warn};

use crate::broker::{ConsumerGroupClient, Fetches, OffsetCommitter, RebalanceListener};
use crate::error::{ConsumerError, FetchError};
use crate::kafka::context::{commit_sync, SplitConsumerContext};
use crate::kafka::types::{PartitionOffset, Record};

/// Timeouts for the rdkafka-backed group client
#[derive(Debug, Clone)]
pub struct KafkaGroupClientConfig {
    /// Longest a fetch waits for its first record
    pub poll_timeout: Duration,
    /// Bound on the startup metadata ping
    pub connect_timeout: Duration,
    /// Longest a close waits for the group to take the partitions back
    pub close_timeout: Duration,
}

impl Default for KafkaGroupClientConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(30),
        }
    }
}

/// How the poll loop should treat an error returned by a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FetchErrorKind {
    /// Expected during normal operation or retried by librdkafka on its own
    Informational,
    Fatal,
}

pub(crate) fn classify_fetch_error(err: &KafkaError) -> FetchErrorKind {
    if matches!(err, KafkaError::PartitionEOF(_)) {
        return FetchErrorKind::Informational;
    }

    match err.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::PartitionEOF
            | RDKafkaErrorCode::OperationTimedOut
            | RDKafkaErrorCode::AllBrokersDown
            | RDKafkaErrorCode::BrokerTransportFailure,
        ) => FetchErrorKind::Informational,
        _ => FetchErrorKind::Fatal,
    }
}

/// Consumer-group client over an rdkafka [`BaseConsumer`].
///
/// Everything except `close_allowing_rebalance` and `add_consume_topic` must be
/// called from the single polling thread, which is where rebalance callbacks run.
pub struct KafkaGroupClient {
    consumer: BaseConsumer<SplitConsumerContext>,
    topics: Mutex<BTreeSet<String>>,
    closing: AtomicBool,
    closed: AtomicBool,
    config: KafkaGroupClientConfig,
}

impl KafkaGroupClient {
    /// Create the consumer and check the cluster is reachable
    pub fn connect(
        client_config: &ClientConfig,
        listener: Arc<dyn RebalanceListener>,
        config: KafkaGroupClientConfig,
    ) -> Result<Self, ConsumerError> {
        let consumer: BaseConsumer<SplitConsumerContext> = client_config
            .create_with_context(SplitConsumerContext::new(listener))
            .map_err(ConsumerError::Connect)?;

        let metadata = consumer
            .fetch_metadata(None, config.connect_timeout)
            .map_err(ConsumerError::Connect)?;
        info!(
            broker_count = metadata.brokers().len(),
            "Connected to Kafka cluster"
        );

        Ok(Self {
            consumer,
            topics: Mutex::new(BTreeSet::new()),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            config,
        })
    }

    fn leave_group(&self) {
        info!("Leaving consumer group");
        self.consumer.unsubscribe();

        // Keep polling so librdkafka serves the revoke, which drains the workers
        let deadline = Instant::now() + self.config.close_timeout;
        loop {
            match self.consumer.poll(Duration::from_millis(100)) {
                Some(Ok(_)) => {}
                Some(Err(e)) => debug!(error = %e, "Error while leaving group"),
                None => {}
            }

            match self.consumer.assignment() {
                Ok(tpl) if tpl.count() == 0 => break,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "Failed to read assignment while leaving group");
                    break;
                }
            }

            if Instant::now() >= deadline {
                warn!(
                    timeout_secs = self.config.close_timeout.as_secs(),
                    "Timed out waiting for partitions to be revoked"
                );
                break;
            }
        }

        // Records fetched while leaving were never dispatched
        let dropped = self.consumer.context().take_pending().len();
        if dropped > 0 {
            debug!(dropped, "Discarded records fetched while leaving group");
        }
        self.closed.store(true, Ordering::SeqCst);
        info!("Left consumer group");
    }
}

impl OffsetCommitter for KafkaGroupClient {
    fn commit_offsets(&self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError> {
        commit_sync(&self.consumer, offsets)
    }
}

impl ConsumerGroupClient for KafkaGroupClient {
    fn add_consume_topic(&self, topic: &str) -> Result<(), ConsumerError> {
        let mut topics = self
            .topics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !topics.insert(topic.to_string()) {
            return Ok(());
        }

        let subscription: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&subscription)?;
        info!(topics = ?subscription, "Updated topic subscription");
        Ok(())
    }

    fn poll_records(&self, max_records: usize) -> Fetches {
        if self.closed.load(Ordering::SeqCst) {
            return Fetches::closed();
        }
        if self.closing.load(Ordering::SeqCst) {
            self.leave_group();
            return Fetches::closed();
        }

        let context = self.consumer.context();
        let mut errors = Vec::new();
        let mut collected = 0;
        let mut timeout = self.config.poll_timeout;

        // Wait for the first record, then take whatever is already buffered
        while collected < max_records {
            match self.consumer.poll(timeout) {
                None => break,
                Some(Ok(msg)) => {
                    context.push_pending(Record::from_borrowed_message(&msg));
                    collected += 1;
                }
                Some(Err(e)) => match classify_fetch_error(&e) {
                    FetchErrorKind::Informational => {
                        debug!(error = %e, "Informational consumer error");
                    }
                    FetchErrorKind::Fatal => {
                        errors.push(FetchError::new(None, e.to_string()));
                        break;
                    }
                },
            }
            timeout = Duration::ZERO;
        }

        Fetches::new(context.take_pending(), errors)
    }

    /// Rebalance callbacks are only served from `poll` on the polling thread,
    /// which never happens while records are being dispatched.
    fn allow_rebalance(&self) {}

    fn close_allowing_rebalance(&self) {
        if !self.closing.swap(true, Ordering::SeqCst) {
            info!("Close requested, leaving group on next poll");
        }
    }
}
