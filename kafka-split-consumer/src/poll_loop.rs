//! The single driver of a split consumer: fetch, fan out per partition, let rebalances through.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::ConsumerGroupClient;
use crate::error::ConsumerError;
use crate::kafka::metrics_consts::{
    POLL_LOOP_FETCH_ERRORS, POLL_LOOP_RECORDS_FETCHED, POLL_LOOP_STOPPED,
};
use crate::kafka::partition_worker::PartitionBatch;
use crate::kafka::types::{Record, TopicPartition};
use crate::rebalance_coordinator::RebalanceCoordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Fetching,
    Dispatching,
    /// Between dispatch and the next fetch; rebalance callbacks may run
    RebalanceWindow,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct PollLoopConfig {
    /// Upper bound on records requested per fetch
    pub max_poll_records: usize,
    /// How often marked offsets are committed
    pub commit_interval: Duration,
}

impl Default for PollLoopConfig {
    fn default() -> Self {
        Self {
            max_poll_records: 10_000,
            commit_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum StopReason {
    Cancelled,
    ClientClosed,
    FetchError,
    Fatal,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            StopReason::Cancelled => "cancelled",
            StopReason::ClientClosed => "client_closed",
            StopReason::FetchError => "fetch_error",
            StopReason::Fatal => "fatal",
        }
    }
}

pub struct PollLoop<C: ConsumerGroupClient> {
    client: Arc<C>,
    coordinator: Arc<RebalanceCoordinator>,
    config: PollLoopConfig,
    cancel: CancellationToken,
    state: LoopState,
    next_batch_id: u64,
}

impl<C: ConsumerGroupClient> PollLoop<C> {
    pub fn new(
        client: Arc<C>,
        coordinator: Arc<RebalanceCoordinator>,
        config: PollLoopConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            coordinator,
            config,
            cancel,
            state: LoopState::Idle,
            next_batch_id: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run fetch cycles until the client closes, a fetch fails, or the token is cancelled.
    ///
    /// Blocks the calling thread; rebalance callbacks run on it from inside the fetch.
    /// Every worker still registered when the loop stops is drained before returning.
    pub fn run(&mut self) -> Result<(), ConsumerError> {
        info!(
            max_poll_records = self.config.max_poll_records,
            commit_interval_ms = self.config.commit_interval.as_millis() as u64,
            "Starting poll loop"
        );

        let mut last_commit = Instant::now();
        let (reason, result) = loop {
            if self.cancel.is_cancelled() {
                break (StopReason::Cancelled, Ok(()));
            }

            self.state = LoopState::Fetching;
            let fetches = self.client.poll_records(self.config.max_poll_records);

            if let Some(err) = self.coordinator.take_fatal_error() {
                error!(error = %err, "Rebalance callback failed, stopping poll loop");
                break (StopReason::Fatal, Err(err));
            }

            if fetches.is_client_closed() {
                info!("Consumer client closed, stopping poll loop");
                break (StopReason::ClientClosed, Ok(()));
            }

            if !fetches.errors().is_empty() {
                for fetch_error in fetches.errors() {
                    error!(
                        topic_partition = ?fetch_error.topic_partition(),
                        error = fetch_error.message(),
                        "Fetch error"
                    );
                }
                metrics::counter!(POLL_LOOP_FETCH_ERRORS).increment(fetches.errors().len() as u64);
                break (
                    StopReason::FetchError,
                    Err(ConsumerError::Fetch(fetches.into_errors())),
                );
            }

            self.state = LoopState::Dispatching;
            if !fetches.is_empty() {
                metrics::histogram!(POLL_LOOP_RECORDS_FETCHED).record(fetches.record_count() as f64);
                self.next_batch_id += 1;
                let batch_id = self.next_batch_id;

                if let Err(e) = self.dispatch(fetches.into_partitions(), batch_id) {
                    error!(error = %e, "Failed to dispatch fetched records");
                    break (StopReason::Fatal, Err(e));
                }
            }

            if last_commit.elapsed() >= self.config.commit_interval {
                if let Err(e) = self.coordinator.commit_marked(self.client.as_ref(), "interval") {
                    warn!(error = %e, "Periodic offset commit failed");
                }
                last_commit = Instant::now();
            }

            self.state = LoopState::RebalanceWindow;
            self.client.allow_rebalance();
            self.state = LoopState::Idle;
        };

        self.state = LoopState::Stopped;
        metrics::counter!(POLL_LOOP_STOPPED, "reason" => reason.as_str()).increment(1);

        self.coordinator.release_all();

        if matches!(reason, StopReason::Cancelled) {
            if let Err(e) = self.coordinator.commit_marked(self.client.as_ref(), "shutdown") {
                error!(error = %e, "Failed to commit offsets after cancellation");
            }
        }

        info!(reason = reason.as_str(), "Poll loop stopped");
        result
    }

    fn dispatch(
        &self,
        partitions: Vec<(TopicPartition, Vec<Record>)>,
        batch_id: u64,
    ) -> Result<(), ConsumerError> {
        let assignments = self.coordinator.assignments();
        for (partition, records) in partitions {
            debug!(
                topic = partition.topic(),
                partition = partition.partition(),
                batch_id,
                record_count = records.len(),
                "Dispatching records"
            );
            assignments.route_blocking(PartitionBatch::new(partition, records, batch_id))?;
        }
        Ok(())
    }
}
