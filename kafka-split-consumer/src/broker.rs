//! The seam between the split consumer and the consumer-group client that talks to the broker.

use crate::error::{ConsumerError, FetchError};
use crate::kafka::types::{PartitionOffset, Record, TopicPartition};

/// Result of one fetch from the broker
#[derive(Debug, Default)]
pub struct Fetches {
    records: Vec<Record>,
    errors: Vec<FetchError>,
    closed: bool,
}

impl Fetches {
    pub fn new(records: Vec<Record>, errors: Vec<FetchError>) -> Self {
        Self {
            records,
            errors,
            closed: false,
        }
    }

    pub fn from_records(records: Vec<Record>) -> Self {
        Self::new(records, Vec::new())
    }

    pub fn from_errors(errors: Vec<FetchError>) -> Self {
        Self::new(Vec::new(), errors)
    }

    /// The fetch that tells the poll loop the client has been closed
    pub fn closed() -> Self {
        Self {
            records: Vec::new(),
            errors: Vec::new(),
            closed: true,
        }
    }

    pub fn is_client_closed(&self) -> bool {
        self.closed
    }

    pub fn errors(&self) -> &[FetchError] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<FetchError> {
        self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Group records by partition, in order of each partition's first record.
    /// Fetch order is kept within a partition.
    pub fn into_partitions(self) -> Vec<(TopicPartition, Vec<Record>)> {
        let mut grouped: Vec<(TopicPartition, Vec<Record>)> = Vec::new();
        for record in self.records {
            match grouped
                .iter_mut()
                .find(|(tp, _)| tp == record.topic_partition())
            {
                Some((_, records)) => records.push(record),
                None => grouped.push((record.topic_partition().clone(), vec![record])),
            }
        }
        grouped
    }
}

/// Commits offsets for partitions this member owns
pub trait OffsetCommitter {
    fn commit_offsets(&self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError>;
}

/// Receives consumer group rebalance events.
///
/// Callbacks are invoked synchronously on the thread that polls the client,
/// never while a fetch is being dispatched. The group does not move on to the
/// next generation until the callback returns.
pub trait RebalanceListener: Send + Sync {
    /// Partitions were added to this member
    fn on_assigned(&self, partitions: &[TopicPartition]);

    /// Partitions are being taken away cleanly. Offsets may still be committed
    /// through `committer` before returning.
    fn on_revoked(&self, committer: &dyn OffsetCommitter, partitions: &[TopicPartition]);

    /// Partitions were lost, for example after a session timeout. Another member
    /// may already own them, so nothing is committed.
    fn on_lost(&self, partitions: &[TopicPartition]);
}

/// A consumer-group client as seen by the poll loop.
///
/// Implementations deliver rebalance events to the [`RebalanceListener`] they
/// were built with, from inside `poll_records`, before the records of that
/// call are returned.
pub trait ConsumerGroupClient: OffsetCommitter + Send + Sync {
    /// Add a topic to the group subscription
    fn add_consume_topic(&self, topic: &str) -> Result<(), ConsumerError>;

    /// Fetch up to `max_records` records. May return fewer, or none.
    fn poll_records(&self, max_records: usize) -> Fetches;

    /// Let a rebalance that was held back during dispatch proceed
    fn allow_rebalance(&self);

    /// Leave the group, letting any in-flight rebalance finish first.
    /// The next `poll_records` reports the client as closed.
    fn close_allowing_rebalance(&self);
}
