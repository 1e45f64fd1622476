//! Rebalance coordination for Kafka consumer group rebalances.
//!
//! The coordinator owns every partition worker. The consumer-group client calls it
//! synchronously from the polling thread whenever partitions are assigned, revoked
//! or lost:
//!
//! - **assigned**: a worker is started for each new partition. No I/O.
//! - **revoked**: the workers are removed, drained concurrently, and only then are
//!   the marked offsets committed.
//! - **lost**: the same drain, but nothing is committed since another member may
//!   already own the partitions.
//!
//! Drains block the polling thread through the runtime handle, so a callback
//! returns only when its workers have handled every batch queued before it.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::broker::{OffsetCommitter, RebalanceListener};
use crate::error::ConsumerError;
use crate::kafka::assignments::{shutdown_workers, ActiveAssignments};
use crate::kafka::metrics_consts::{OFFSET_COMMITS, REBALANCE_DRAIN_DURATION_MS, REBALANCE_EVENTS};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::partition_worker::{PartitionWorker, PartitionWorkerConfig};
use crate::kafka::types::TopicPartition;
use crate::registry::RecordHandlerRegistry;

pub struct RebalanceCoordinator {
    handlers: Arc<RecordHandlerRegistry>,
    assignments: Arc<ActiveAssignments>,
    offset_tracker: Arc<OffsetTracker>,
    worker_config: PartitionWorkerConfig,
    rt: Handle,
    /// Set by a callback that cannot continue; the poll loop stops on it
    fatal: Mutex<Option<ConsumerError>>,
}

impl RebalanceCoordinator {
    pub fn new(
        handlers: Arc<RecordHandlerRegistry>,
        assignments: Arc<ActiveAssignments>,
        offset_tracker: Arc<OffsetTracker>,
        worker_config: PartitionWorkerConfig,
        rt: Handle,
    ) -> Self {
        Self {
            handlers,
            assignments,
            offset_tracker,
            worker_config,
            rt,
            fatal: Mutex::new(None),
        }
    }

    pub fn assignments(&self) -> &Arc<ActiveAssignments> {
        &self.assignments
    }

    pub fn offset_tracker(&self) -> &Arc<OffsetTracker> {
        &self.offset_tracker
    }

    /// Take the error a callback recorded, if any
    pub fn take_fatal_error(&self) -> Option<ConsumerError> {
        self.fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn set_fatal_error(&self, err: ConsumerError) {
        let mut fatal = self
            .fatal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // The first error is the cause, later ones are usually consequences
        if fatal.is_none() {
            *fatal = Some(err);
        }
    }

    /// Commit every offset marked since the last successful commit.
    ///
    /// Nothing is sent when no partition has progressed.
    pub fn commit_marked(
        &self,
        committer: &dyn OffsetCommitter,
        trigger: &'static str,
    ) -> Result<(), ConsumerError> {
        let offsets = self.offset_tracker.committable_offsets();
        if offsets.is_empty() {
            return Ok(());
        }

        match committer.commit_offsets(&offsets) {
            Ok(()) => {
                self.offset_tracker.mark_committed(&offsets);
                metrics::counter!(OFFSET_COMMITS, "trigger" => trigger, "status" => "success")
                    .increment(1);
                info!(
                    trigger,
                    partition_count = offsets.len(),
                    "Committed marked offsets"
                );
                Ok(())
            }
            Err(e) => {
                metrics::counter!(OFFSET_COMMITS, "trigger" => trigger, "status" => "error")
                    .increment(1);
                Err(e)
            }
        }
    }

    /// Drain every remaining worker. Used when the poll loop exits.
    pub fn release_all(&self) {
        let workers = self.assignments.remove_all();
        if workers.is_empty() {
            return;
        }

        info!(
            worker_count = workers.len(),
            "Draining remaining partition workers"
        );
        self.drain(workers, "release");
    }

    fn drain(&self, workers: Vec<PartitionWorker>, event: &'static str) {
        let started = Instant::now();
        let worker_count = workers.len();

        self.rt.block_on(shutdown_workers(workers));

        let elapsed = started.elapsed();
        metrics::histogram!(REBALANCE_DRAIN_DURATION_MS, "event" => event)
            .record(elapsed.as_millis() as f64);
        info!(
            event,
            worker_count,
            duration_ms = elapsed.as_millis() as u64,
            "Partition workers drained"
        );
    }
}

impl RebalanceListener for RebalanceCoordinator {
    fn on_assigned(&self, partitions: &[TopicPartition]) {
        metrics::counter!(REBALANCE_EVENTS, "event" => "assigned").increment(1);
        info!(
            partition_count = partitions.len(),
            partitions = ?partitions,
            "Partitions assigned"
        );

        for partition in partitions {
            let Some(handler) = self.handlers.get(partition.topic()) else {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    "Assigned partition has no registered record handler"
                );
                self.set_fatal_error(ConsumerError::MissingHandler(
                    partition.topic().to_string(),
                ));
                continue;
            };

            let created = self.assignments.insert_with(partition, || {
                PartitionWorker::new(
                    partition.clone(),
                    handler,
                    self.offset_tracker.clone(),
                    &self.worker_config,
                    &self.rt,
                )
            });
            if created {
                info!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    "Created partition worker"
                );
            }
        }
    }

    fn on_revoked(&self, committer: &dyn OffsetCommitter, partitions: &[TopicPartition]) {
        metrics::counter!(REBALANCE_EVENTS, "event" => "revoked").increment(1);
        info!(
            partition_count = partitions.len(),
            partitions = ?partitions,
            "Partitions revoked"
        );

        let workers = self.assignments.remove_many(partitions);
        if workers.is_empty() {
            info!("No workers for revoked partitions, nothing to drain");
        } else {
            self.drain(workers, "revoked");
        }

        if let Err(e) = self.commit_marked(committer, "revoke") {
            // Not retried: the next owner resumes from the last committed offset
            error!(error = %e, "Failed to commit offsets for revoked partitions");
        }

        for partition in partitions {
            self.offset_tracker.clear_partition(partition);
        }
    }

    fn on_lost(&self, partitions: &[TopicPartition]) {
        metrics::counter!(REBALANCE_EVENTS, "event" => "lost").increment(1);
        warn!(
            partition_count = partitions.len(),
            partitions = ?partitions,
            "Partitions lost, draining without commit"
        );

        let workers = self.assignments.remove_many(partitions);
        if !workers.is_empty() {
            self.drain(workers, "lost");
        }

        for partition in partitions {
            self.offset_tracker.clear_partition(partition);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::partition_worker::PartitionBatch;
    use crate::kafka::types::{PartitionOffset, Record};
    use crate::test_utils::{RecordingCommitter, RecordingHandler};
    use std::time::Duration;

    struct Fixture {
        coordinator: Arc<RebalanceCoordinator>,
        handler: Arc<RecordingHandler>,
    }

    fn fixture(handler: RecordingHandler, topics: &[&str]) -> Fixture {
        let handler = Arc::new(handler);
        let registry = Arc::new(RecordHandlerRegistry::new());
        for topic in topics {
            registry.register(topic, handler.clone()).unwrap();
        }
        let coordinator = Arc::new(RebalanceCoordinator::new(
            registry,
            Arc::new(ActiveAssignments::new()),
            Arc::new(OffsetTracker::new()),
            PartitionWorkerConfig::default(),
            Handle::current(),
        ));
        Fixture {
            coordinator,
            handler,
        }
    }

    fn batch(partition: &TopicPartition, offsets: std::ops::Range<i64>) -> PartitionBatch {
        let records = offsets
            .map(|o| Record::new_for_test(partition.clone(), o, "body"))
            .collect();
        PartitionBatch::new(partition.clone(), records, 1)
    }

    /// Run a callback the way the poll loop does: on a blocking thread
    async fn on_poll_thread<F, R>(f: F) -> R
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f).await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_assign_creates_one_worker_per_partition() {
        let f = fixture(RecordingHandler::new(), &["emails"]);
        let partitions = vec![TopicPartition::new("emails", 0), TopicPartition::new("emails", 1)];

        f.coordinator.on_assigned(&partitions);

        assert_eq!(f.coordinator.assignments().partitions(), partitions);
        assert!(f.coordinator.take_fatal_error().is_none());

        let coordinator = f.coordinator.clone();
        on_poll_thread(move || coordinator.release_all()).await;
        assert!(f.coordinator.assignments().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_assign_without_handler_is_fatal() {
        let f = fixture(RecordingHandler::new(), &["emails"]);

        f.coordinator.on_assigned(&[TopicPartition::new("bounces", 0)]);

        assert!(f.coordinator.assignments().is_empty());
        assert!(matches!(
            f.coordinator.take_fatal_error(),
            Some(ConsumerError::MissingHandler(topic)) if topic == "bounces"
        ));
        assert!(f.coordinator.take_fatal_error().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_revoke_drains_queued_batches_before_commit() {
        let f = fixture(
            RecordingHandler::with_delay(Duration::from_millis(50)),
            &["emails"],
        );
        let t0 = TopicPartition::new("emails", 0);
        f.coordinator.on_assigned(std::slice::from_ref(&t0));

        let coordinator = f.coordinator.clone();
        let handler = f.handler.clone();
        let committer = Arc::new(RecordingCommitter::new());
        let committer_clone = committer.clone();
        let tp = t0.clone();
        on_poll_thread(move || {
            let assignments = coordinator.assignments();
            assignments.route_blocking(batch(&tp, 0..2)).unwrap();
            assignments.route_blocking(batch(&tp, 2..4)).unwrap();

            committer_clone.on_commit({
                let handler = handler.clone();
                let tp = tp.clone();
                move || handler.offsets_for(&tp).len()
            });
            coordinator.on_revoked(committer_clone.as_ref(), std::slice::from_ref(&tp));
        })
        .await;

        assert_eq!(f.handler.offsets_for(&t0), vec![0, 1, 2, 3]);
        assert_eq!(
            committer.commits(),
            vec![vec![PartitionOffset::new(t0.clone(), 4)]]
        );
        // Every record was handled by the time the commit was issued
        assert_eq!(committer.observed_at_commit(), vec![4]);
        assert!(!f.coordinator.assignments().contains(&t0));
        assert_eq!(f.coordinator.offset_tracker().partition_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lost_drains_without_commit() {
        let f = fixture(RecordingHandler::new(), &["emails"]);
        let t0 = TopicPartition::new("emails", 0);
        f.coordinator.on_assigned(std::slice::from_ref(&t0));

        let coordinator = f.coordinator.clone();
        let tp = t0.clone();
        on_poll_thread(move || {
            coordinator
                .assignments()
                .route_blocking(batch(&tp, 10..13))
                .unwrap();
            coordinator.on_lost(std::slice::from_ref(&tp));
        })
        .await;

        assert_eq!(f.handler.offsets_for(&t0), vec![10, 11, 12]);
        assert!(f.coordinator.assignments().is_empty());
        assert_eq!(f.coordinator.offset_tracker().processed_offset(&t0), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_revoke_of_unknown_partition_is_noop() {
        let f = fixture(RecordingHandler::new(), &["emails"]);
        let owned = TopicPartition::new("emails", 0);
        f.coordinator.on_assigned(std::slice::from_ref(&owned));

        let coordinator = f.coordinator.clone();
        let committer = Arc::new(RecordingCommitter::new());
        let committer_clone = committer.clone();
        on_poll_thread(move || {
            coordinator.on_revoked(committer_clone.as_ref(), &[TopicPartition::new("emails", 9)]);
            coordinator.on_lost(&[TopicPartition::new("emails", 9)]);
        })
        .await;

        assert!(f.coordinator.assignments().contains(&owned));
        assert!(committer.commits().is_empty());

        let coordinator = f.coordinator.clone();
        on_poll_thread(move || coordinator.release_all()).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_commit_failure_keeps_offsets_committable() {
        let f = fixture(RecordingHandler::new(), &["emails"]);
        let t0 = TopicPartition::new("emails", 0);
        f.coordinator.offset_tracker().mark_processed(&t0, 42);

        let committer = RecordingCommitter::failing();
        assert!(f.coordinator.commit_marked(&committer, "interval").is_err());
        assert_eq!(
            f.coordinator.offset_tracker().committable_offsets(),
            vec![PartitionOffset::new(t0.clone(), 42)]
        );

        let committer = RecordingCommitter::new();
        f.coordinator.commit_marked(&committer, "interval").unwrap();
        f.coordinator.commit_marked(&committer, "interval").unwrap();
        assert_eq!(committer.commits().len(), 1, "unchanged marks are not recommitted");
    }
}
