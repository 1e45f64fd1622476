use std::sync::{Arc, Mutex};

use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance};
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tracing::{debug, error, info, warn};

use crate::broker::{OffsetCommitter, RebalanceListener};
use crate::error::ConsumerError;
use crate::kafka::metrics_consts::REBALANCE_PENDING_RECORDS_DROPPED;
use crate::kafka::types::{PartitionOffset, Record, TopicPartition};

/// rdkafka context that forwards rebalances to a [`RebalanceListener`].
///
/// librdkafka serves rebalance callbacks from inside `poll`, on the polling
/// thread, so the listener runs synchronously between record deliveries. Records
/// collected earlier in the same fetch are buffered here; those of partitions
/// released by the callback are dropped before they reach a worker.
pub struct SplitConsumerContext {
    listener: Arc<dyn RebalanceListener>,
    pending: Mutex<Vec<Record>>,
}

impl SplitConsumerContext {
    pub fn new(listener: Arc<dyn RebalanceListener>) -> Self {
        Self {
            listener,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push_pending(&self, record: Record) {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }

    pub(crate) fn take_pending(&self) -> Vec<Record> {
        std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }

    /// Drop buffered records of released partitions, returning how many were dropped
    pub(crate) fn drop_pending_for(&self, partitions: &[TopicPartition]) -> usize {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = pending.len();
        pending.retain(|r| !partitions.contains(r.topic_partition()));
        let dropped = before - pending.len();

        if dropped > 0 {
            metrics::counter!(REBALANCE_PENDING_RECORDS_DROPPED).increment(dropped as u64);
            info!(
                dropped,
                "Dropped uncollected records of released partitions"
            );
        }
        dropped
    }
}

fn to_partitions(tpl: &TopicPartitionList) -> Vec<TopicPartition> {
    tpl.elements().into_iter().map(TopicPartition::from).collect()
}

/// Synchronously commit `offsets`, each being the next offset to consume
pub(crate) fn commit_sync<C: ConsumerContext>(
    consumer: &BaseConsumer<C>,
    offsets: &[PartitionOffset],
) -> Result<(), ConsumerError> {
    if offsets.is_empty() {
        return Ok(());
    }

    let mut tpl = TopicPartitionList::new();
    for po in offsets {
        tpl.add_partition_offset(
            po.partition().topic(),
            po.partition().partition(),
            Offset::Offset(po.offset()),
        )?;
    }

    consumer
        .commit(&tpl, CommitMode::Sync)
        .map_err(|e| ConsumerError::Commit(e.to_string()))
}

/// Commits through the consumer that is running the rebalance callback
struct CallbackCommitter<'a, C: ConsumerContext>(&'a BaseConsumer<C>);

impl<C: ConsumerContext> OffsetCommitter for CallbackCommitter<'_, C> {
    fn commit_offsets(&self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError> {
        commit_sync(self.0, offsets)
    }
}

impl ClientContext for SplitConsumerContext {}

impl ConsumerContext for SplitConsumerContext {
    fn pre_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                // Cooperative-sticky sends empty revokes when nothing moves
                if tpl.count() == 0 {
                    debug!("Skipping empty revoke rebalance");
                    return;
                }

                let partitions = to_partitions(tpl);
                self.drop_pending_for(&partitions);

                if base_consumer.assignment_lost() {
                    warn!(
                        partition_count = partitions.len(),
                        "Assignment lost, releasing partitions without commit"
                    );
                    self.listener.on_lost(&partitions);
                } else {
                    info!(partition_count = partitions.len(), "Revoking partitions");
                    self.listener
                        .on_revoked(&CallbackCommitter(base_consumer), &partitions);
                }
            }
            Rebalance::Assign(tpl) => {
                debug!(partition_count = tpl.count(), "Pre-rebalance assign event");
            }
            Rebalance::Error(e) => {
                error!(error = %e, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                if tpl.count() == 0 {
                    debug!("Skipping empty assign rebalance");
                    return;
                }

                let partitions = to_partitions(tpl);
                info!(partition_count = partitions.len(), "Assigning partitions");
                self.listener.on_assigned(&partitions);
            }
            Rebalance::Revoke(_) => {
                debug!("Post-rebalance revoke event");
            }
            Rebalance::Error(e) => {
                error!(error = %e, "Post-rebalance error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingListener;

    #[test]
    fn test_drop_pending_only_removes_released_partitions() {
        let context = SplitConsumerContext::new(Arc::new(RecordingListener::default()));
        let t0 = TopicPartition::new("emails", 0);
        let t1 = TopicPartition::new("emails", 1);
        context.push_pending(Record::new_for_test(t0.clone(), 1, "a"));
        context.push_pending(Record::new_for_test(t1.clone(), 1, "b"));
        context.push_pending(Record::new_for_test(t0.clone(), 2, "c"));

        assert_eq!(context.drop_pending_for(std::slice::from_ref(&t0)), 2);

        let remaining = context.take_pending();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].topic_partition(), &t1);
        assert!(context.take_pending().is_empty());
    }

    #[test]
    fn test_to_partitions_from_list() {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition("emails", 0);
        tpl.add_partition("bounces", 3);

        assert_eq!(
            to_partitions(&tpl),
            vec![TopicPartition::new("emails", 0), TopicPartition::new("bounces", 3)]
        );
    }
}
