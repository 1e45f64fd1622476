//! Active assignments - the partitions this member owns, each with its worker
//!
//! Only the rebalance coordinator adds and removes workers. The poll loop looks
//! a worker up once per dispatch and sends to it without holding the map guard.

use std::time::Instant;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::info;

use crate::error::ConsumerError;
use crate::kafka::metrics_consts::{
    PARTITION_WORKERS_ACTIVE, PARTITION_WORKER_BACKPRESSURE_TOTAL,
    PARTITION_WORKER_BACKPRESSURE_WAIT_MS,
};
use crate::kafka::partition_worker::{PartitionBatch, PartitionWorker};
use crate::kafka::types::TopicPartition;

#[derive(Default)]
pub struct ActiveAssignments {
    workers: DashMap<TopicPartition, PartitionWorker>,
}

impl ActiveAssignments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert the worker built by `make_worker` unless the partition already has one.
    ///
    /// A live worker is kept on rapid re-assignment so in-flight batches are not lost.
    /// Returns whether a new worker was inserted.
    pub fn insert_with<F>(&self, partition: &TopicPartition, make_worker: F) -> bool
    where
        F: FnOnce() -> PartitionWorker,
    {
        if self.workers.contains_key(partition) {
            info!(
                topic = partition.topic(),
                partition = partition.partition(),
                "Worker already exists, reusing"
            );
            return false;
        }

        self.workers.insert(partition.clone(), make_worker());
        metrics::gauge!(PARTITION_WORKERS_ACTIVE).set(self.workers.len() as f64);
        true
    }

    /// Remove the workers of the given partitions, returning them for shutdown.
    /// Partitions without a worker are skipped.
    pub fn remove_many(&self, partitions: &[TopicPartition]) -> Vec<PartitionWorker> {
        let removed: Vec<PartitionWorker> = partitions
            .iter()
            .filter_map(|p| self.workers.remove(p).map(|(_, w)| w))
            .collect();

        if !removed.is_empty() {
            metrics::gauge!(PARTITION_WORKERS_ACTIVE).set(self.workers.len() as f64);
        }
        removed
    }

    /// Remove every worker, returning them for shutdown
    pub fn remove_all(&self) -> Vec<PartitionWorker> {
        let keys = self.partitions();
        self.remove_many(&keys)
    }

    /// Send a batch to its partition's worker from a blocking thread.
    ///
    /// Blocks while the worker's queue is full. Must not be called from async code.
    pub fn route_blocking(&self, batch: PartitionBatch) -> Result<(), ConsumerError> {
        let partition = batch.partition.clone();

        // Take the sender and drop the guard so a full queue never blocks
        // coordinator access to other partitions
        let (sender, capacity) = {
            let worker = self
                .workers
                .get(&partition)
                .ok_or_else(|| ConsumerError::NoWorker(partition.clone()))?;
            (worker.sender(), worker.capacity())
        };

        let send_start = if capacity == 0 {
            metrics::counter!(
                PARTITION_WORKER_BACKPRESSURE_TOTAL,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition().to_string()
            )
            .increment(1);
            Some(Instant::now())
        } else {
            None
        };

        let result = sender
            .blocking_send(batch)
            .map_err(|_| ConsumerError::WorkerGone(partition.clone()));

        if let Some(start) = send_start {
            metrics::histogram!(
                PARTITION_WORKER_BACKPRESSURE_WAIT_MS,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition().to_string()
            )
            .record(start.elapsed().as_millis() as f64);
        }

        result
    }

    pub fn contains(&self, partition: &TopicPartition) -> bool {
        self.workers.contains_key(partition)
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Owned partitions, sorted
    pub fn partitions(&self) -> Vec<TopicPartition> {
        let mut partitions: Vec<TopicPartition> =
            self.workers.iter().map(|r| r.key().clone()).collect();
        partitions.sort();
        partitions
    }
}

/// Stop workers concurrently, so the total wait is bounded by the slowest one
pub async fn shutdown_workers(workers: Vec<PartitionWorker>) {
    join_all(workers.into_iter().map(|w| w.shutdown())).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::offset_tracker::OffsetTracker;
    use crate::kafka::partition_worker::PartitionWorkerConfig;
    use crate::kafka::types::Record;
    use crate::test_utils::RecordingHandler;
    use std::sync::Arc;
    use tokio::runtime::Handle;

    fn worker(partition: &TopicPartition, handler: Arc<RecordingHandler>) -> PartitionWorker {
        PartitionWorker::new(
            partition.clone(),
            handler,
            Arc::new(OffsetTracker::new()),
            &PartitionWorkerConfig::default(),
            &Handle::current(),
        )
    }

    fn batch(partition: &TopicPartition, offset: i64) -> PartitionBatch {
        PartitionBatch::new(
            partition.clone(),
            vec![Record::new_for_test(partition.clone(), offset, "body")],
            1,
        )
    }

    #[tokio::test]
    async fn test_insert_reuses_existing_worker() {
        let assignments = ActiveAssignments::new();
        let partition = TopicPartition::new("emails", 0);
        let handler = Arc::new(RecordingHandler::new());

        assert!(assignments.insert_with(&partition, || worker(&partition, handler.clone())));
        assert!(!assignments.insert_with(&partition, || worker(&partition, handler.clone())));
        assert_eq!(assignments.len(), 1);

        shutdown_workers(assignments.remove_all()).await;
        assert!(assignments.is_empty());
    }

    #[tokio::test]
    async fn test_remove_skips_unknown_partitions() {
        let assignments = ActiveAssignments::new();
        let owned = TopicPartition::new("emails", 0);
        let handler = Arc::new(RecordingHandler::new());
        assignments.insert_with(&owned, || worker(&owned, handler));

        let removed = assignments.remove_many(&[
            TopicPartition::new("emails", 7),
            owned.clone(),
        ]);

        assert_eq!(removed.len(), 1);
        assert!(!assignments.contains(&owned));
        shutdown_workers(removed).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_route_blocking_requires_worker() {
        let assignments = Arc::new(ActiveAssignments::new());
        let owned = TopicPartition::new("emails", 0);
        let handler = Arc::new(RecordingHandler::new());
        assignments.insert_with(&owned, || worker(&owned, handler.clone()));

        let router = assignments.clone();
        let unowned = TopicPartition::new("emails", 1);
        let (owned_result, unowned_result) = tokio::task::spawn_blocking({
            let owned = owned.clone();
            move || {
                (
                    router.route_blocking(batch(&owned, 10)),
                    router.route_blocking(batch(&unowned, 10)),
                )
            }
        })
        .await
        .unwrap();

        assert!(owned_result.is_ok());
        assert!(matches!(unowned_result, Err(ConsumerError::NoWorker(_))));

        shutdown_workers(assignments.remove_all()).await;
        assert_eq!(handler.offsets_for(&owned), vec![10]);
    }
}
