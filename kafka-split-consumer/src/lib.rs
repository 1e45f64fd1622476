//! Kafka split consumer: one ordered worker per assigned partition, drained on every rebalance.
//!
//! ## Error logging (anyhow)
//!
//! When logging `anyhow::Error` or other error types that implement `std::error::Error` with
//! a cause chain, use formats that include the full chain so root causes are visible in logs:
//!
//! - **Inline format:** `{e:#}`, the full chain on one line (`outer: middle: root cause`).
//! - **Structured field:** `error = ?e`, the full chain with `Caused by:` sections (Debug).
//!
//! Record handlers return `anyhow::Result`; workers log failures with `error = ?e`.

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod kafka;
pub mod metrics_server;
pub mod poll_loop;
pub mod rebalance_coordinator;
pub mod registry;
pub mod shutdown;
pub mod test_utils;

pub use broker::{ConsumerGroupClient, Fetches, OffsetCommitter, RebalanceListener};
pub use client::{SplitConsumerClient, SplitConsumerConfig};
pub use error::{ConsumerError, FetchError};
pub use registry::{handler_fn, RecordHandler};
