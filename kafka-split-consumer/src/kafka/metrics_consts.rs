// ==== Poll loop metrics ====
/// Histogram for number of records returned by one poll cycle
pub const POLL_LOOP_RECORDS_FETCHED: &str = "split_consumer_poll_records_fetched";

/// Counter for fetch errors that stopped the poll loop
pub const POLL_LOOP_FETCH_ERRORS: &str = "split_consumer_fetch_errors_total";

/// Counter for poll loop exits, labelled by reason
pub const POLL_LOOP_STOPPED: &str = "split_consumer_poll_loop_stopped_total";

// ==== Partition worker metrics ====
/// Gauge for the number of live partition workers
pub const PARTITION_WORKERS_ACTIVE: &str = "split_consumer_partition_workers_active";

/// Counter for records handed to a record handler, labelled by outcome
pub const PARTITION_WORKER_RECORDS_HANDLED: &str = "split_consumer_records_handled_total";

/// Histogram for time spent handling one batch
pub const PARTITION_WORKER_BATCH_DURATION_MS: &str = "split_consumer_batch_duration_ms";

/// Counter for dispatches that found the worker queue full
pub const PARTITION_WORKER_BACKPRESSURE_TOTAL: &str = "split_consumer_backpressure_total";

/// Histogram for time the poll loop waited on a full worker queue
pub const PARTITION_WORKER_BACKPRESSURE_WAIT_MS: &str = "split_consumer_backpressure_wait_ms";

// ==== Rebalance metrics ====
/// Counter for rebalance callbacks, labelled by event (assigned/revoked/lost)
pub const REBALANCE_EVENTS: &str = "split_consumer_rebalance_events_total";

/// Histogram for time spent draining workers in a revoke or lost callback
pub const REBALANCE_DRAIN_DURATION_MS: &str = "split_consumer_rebalance_drain_duration_ms";

/// Counter for records dropped from a pending fetch because their partition was released
pub const REBALANCE_PENDING_RECORDS_DROPPED: &str = "split_consumer_pending_records_dropped_total";

// ==== Offset metrics ====
/// Counter for offset commits, labelled by trigger and status
pub const OFFSET_COMMITS: &str = "split_consumer_offset_commits_total";

/// Counter for processed-offset marks that would have moved backwards
pub const OFFSET_TRACKER_REGRESSION_IGNORED: &str = "split_consumer_offset_regression_ignored_total";
