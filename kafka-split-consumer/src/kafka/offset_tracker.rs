//! Offset Tracker - records which offsets partition workers have finished processing
//!
//! Workers mark a partition's next offset to consume after each handled batch.
//! Marking never talks to the broker: commits are driven by the poll loop (periodically)
//! and by the rebalance coordinator (after draining revoked partitions), both of which
//! read the uncommitted marks from here.

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::kafka::metrics_consts::OFFSET_TRACKER_REGRESSION_IGNORED;
use crate::kafka::types::{PartitionOffset, TopicPartition};

/// Marked and committed positions for one partition
#[derive(Debug, Clone, Copy)]
struct PartitionMarks {
    /// The next offset to consume (highest processed + 1)
    processed: i64,
    /// The last offset successfully committed to the group, if any
    committed: Option<i64>,
}

/// Thread-safe tracker for processed offsets per partition
#[derive(Default)]
pub struct OffsetTracker {
    partitions: DashMap<TopicPartition, PartitionMarks>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark everything before `next_offset` as processed for a partition.
    ///
    /// Marks only move forward; an older mark is logged and ignored.
    pub fn mark_processed(&self, partition: &TopicPartition, next_offset: i64) {
        self.partitions
            .entry(partition.clone())
            .and_modify(|marks| {
                if next_offset < marks.processed {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        current = marks.processed,
                        attempted = next_offset,
                        "Ignoring processed offset that would move backwards"
                    );
                    metrics::counter!(OFFSET_TRACKER_REGRESSION_IGNORED).increment(1);
                } else {
                    marks.processed = next_offset;
                }
            })
            .or_insert_with(|| {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    offset = next_offset,
                    "Tracking processed offsets for partition"
                );
                PartitionMarks {
                    processed: next_offset,
                    committed: None,
                }
            });
    }

    /// Offsets marked since the last successful commit, sorted by partition.
    pub fn committable_offsets(&self) -> Vec<PartitionOffset> {
        let mut offsets: Vec<PartitionOffset> = self
            .partitions
            .iter()
            .filter(|entry| entry.value().committed != Some(entry.value().processed))
            .map(|entry| PartitionOffset::new(entry.key().clone(), entry.value().processed))
            .collect();
        offsets.sort_by(|a, b| a.partition().cmp(b.partition()));
        offsets
    }

    /// Record offsets the broker accepted, so they are not committed again.
    pub fn mark_committed(&self, offsets: &[PartitionOffset]) {
        for offset in offsets {
            if let Some(mut marks) = self.partitions.get_mut(offset.partition()) {
                marks.committed = Some(offset.offset());
            }
        }
    }

    pub fn processed_offset(&self, partition: &TopicPartition) -> Option<i64> {
        self.partitions.get(partition).map(|m| m.processed)
    }

    pub fn committed_offset(&self, partition: &TopicPartition) -> Option<i64> {
        self.partitions.get(partition).and_then(|m| m.committed)
    }

    /// Forget a partition once it has been revoked or lost
    pub fn clear_partition(&self, partition: &TopicPartition) {
        if self.partitions.remove(partition).is_some() {
            debug!(
                topic = partition.topic(),
                partition = partition.partition(),
                "Cleared offset tracking for released partition"
            );
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}
