//! Partition Worker - Dedicated worker for processing records from a single partition
//!
//! Each assigned partition gets its own worker task with a bounded queue, ensuring:
//! 1. Records of a partition are handled strictly in order, one at a time
//! 2. Partitions are processed in parallel
//! 3. Backpressure reaches the poll loop when a partition falls behind

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::kafka::metrics_consts::{
    PARTITION_WORKER_BATCH_DURATION_MS, PARTITION_WORKER_RECORDS_HANDLED,
};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::{Record, TopicPartition};
use crate::registry::RecordHandler;

/// The records of one partition from a single poll cycle, in offset order
#[derive(Debug)]
pub struct PartitionBatch {
    pub partition: TopicPartition,
    pub records: Vec<Record>,
    /// Sequential poll-cycle ID, for tracing
    pub batch_id: u64,
}

impl PartitionBatch {
    pub fn new(partition: TopicPartition, records: Vec<Record>, batch_id: u64) -> Self {
        Self {
            partition,
            records,
            batch_id,
        }
    }

    /// The offset to resume from once every record of this batch is handled
    pub fn next_offset(&self) -> Option<i64> {
        self.records.iter().map(|r| r.offset()).max().map(|o| o + 1)
    }
}

/// Configuration for partition workers
#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    /// Number of batches that can wait in a partition's queue
    pub queue_depth: usize,
}

impl Default for PartitionWorkerConfig {
    fn default() -> Self {
        Self { queue_depth: 5 }
    }
}

/// A worker that processes records for a single partition
pub struct PartitionWorker {
    partition: TopicPartition,
    sender: mpsc::Sender<PartitionBatch>,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    /// Create a worker and start its task on the given runtime
    pub fn new(
        partition: TopicPartition,
        handler: Arc<dyn RecordHandler>,
        offset_tracker: Arc<OffsetTracker>,
        config: &PartitionWorkerConfig,
        rt: &Handle,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_depth.max(1));
        let partition_clone = partition.clone();

        let handle = rt.spawn(async move {
            Self::run_worker(partition_clone, receiver, handler, offset_tracker).await;
        });

        Self {
            partition,
            sender,
            handle: Some(handle),
        }
    }

    /// A clone of the queue sender, so callers can release map guards before blocking
    pub fn sender(&self) -> mpsc::Sender<PartitionBatch> {
        self.sender.clone()
    }

    /// Free slots left in the queue
    pub fn capacity(&self) -> usize {
        self.sender.capacity()
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    /// Stop the worker once its queue is drained and wait for it to finish.
    ///
    /// Closing the queue is the stop signal: batches already queued are still
    /// handled. Completion is the worker task ending.
    pub async fn shutdown(mut self) {
        drop(self.sender);

        if let Some(handle) = self.handle.take() {
            match handle.await {
                Ok(()) => {
                    debug!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition(),
                        "Partition worker shut down gracefully"
                    );
                }
                Err(e) => {
                    warn!(
                        topic = self.partition.topic(),
                        partition = self.partition.partition(),
                        error = %e,
                        "Partition worker task failed during shutdown"
                    );
                }
            }
        }
    }

    /// The main worker loop
    async fn run_worker(
        partition: TopicPartition,
        mut receiver: mpsc::Receiver<PartitionBatch>,
        handler: Arc<dyn RecordHandler>,
        offset_tracker: Arc<OffsetTracker>,
    ) {
        info!(
            topic = partition.topic(),
            partition = partition.partition(),
            "Starting partition worker"
        );

        while let Some(batch) = receiver.recv().await {
            let started = Instant::now();
            let next_offset = batch.next_offset();

            debug!(
                topic = partition.topic(),
                partition = partition.partition(),
                batch_id = batch.batch_id,
                record_count = batch.records.len(),
                first_offset = ?batch.records.first().map(|r| r.offset()),
                last_offset = ?batch.records.last().map(|r| r.offset()),
                "Processing batch"
            );

            for record in &batch.records {
                Self::handle_record(&partition, handler.as_ref(), record).await;
            }

            if let Some(next_offset) = next_offset {
                offset_tracker.mark_processed(&partition, next_offset);
            }

            metrics::histogram!(PARTITION_WORKER_BATCH_DURATION_MS)
                .record(started.elapsed().as_millis() as f64);
        }

        info!(
            topic = partition.topic(),
            partition = partition.partition(),
            "Partition worker shutting down"
        );
    }

    /// Run the handler for one record. Failures and panics are logged and the
    /// worker moves on to the next record.
    async fn handle_record(partition: &TopicPartition, handler: &dyn RecordHandler, record: &Record) {
        let outcome = AssertUnwindSafe(handler.handle(record)).catch_unwind().await;

        let status = match outcome {
            Ok(Ok(())) => "success",
            Ok(Err(e)) => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    offset = record.offset(),
                    error = ?e,
                    "Record handler failed - continuing with next record"
                );
                "error"
            }
            Err(_) => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    offset = record.offset(),
                    "Record handler panicked - continuing with next record"
                );
                "panic"
            }
        };

        metrics::counter!(
            PARTITION_WORKER_RECORDS_HANDLED,
            "topic" => partition.topic().to_string(),
            "status" => status
        )
        .increment(1);
    }
}
