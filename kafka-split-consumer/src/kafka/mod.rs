// Kafka module - partition workers, offset tracking and the rdkafka-backed group client
pub mod assignments;
pub mod config;
pub mod context;
pub mod group_client;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod partition_worker;
pub mod types;

// Public API
pub use config::ConsumerConfigBuilder;
pub use group_client::{KafkaGroupClient, KafkaGroupClientConfig};
pub use types::{PartitionOffset, Record, TopicPartition};
