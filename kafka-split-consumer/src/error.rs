use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::kafka::types::TopicPartition;

/// A broker-level error reported by a fetch. Any of these stops the poll loop.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct FetchError {
    topic_partition: Option<TopicPartition>,
    message: String,
}

impl FetchError {
    pub fn new(topic_partition: Option<TopicPartition>, message: impl Into<String>) -> Self {
        Self {
            topic_partition,
            message: message.into(),
        }
    }

    pub fn topic_partition(&self) -> Option<&TopicPartition> {
        self.topic_partition.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Enumeration of errors surfaced by the split consumer.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to connect to kafka: {0}")]
    Connect(#[source] KafkaError),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("fetch failed with {} error(s): {}", .0.len(), join_fetch_errors(.0))]
    Fetch(Vec<FetchError>),
    #[error("no record handler registered for assigned topic {0}")]
    MissingHandler(String),
    #[error("no partition worker for {0} - was it assigned?")]
    NoWorker(TopicPartition),
    #[error("partition worker for {0} is no longer accepting batches")]
    WorkerGone(TopicPartition),
    #[error("offset commit failed: {0}")]
    Commit(String),
    #[error("the client is already polling")]
    AlreadyPolling,
    #[error("a tokio runtime is required to run partition workers")]
    NoRuntime,
    #[error("poll loop task failed: {0}")]
    PollTask(String),
}

fn join_fetch_errors(errors: &[FetchError]) -> String {
    errors
        .iter()
        .map(|e| match e.topic_partition() {
            Some(tp) => format!("{tp}: {}", e.message()),
            None => e.message().to_string(),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_display_lists_every_error() {
        let err = ConsumerError::Fetch(vec![
            FetchError::new(Some(TopicPartition::new("emails", 3)), "leader not available"),
            FetchError::new(None, "authentication failed"),
        ]);

        assert_eq!(
            err.to_string(),
            "fetch failed with 2 error(s): emails:3: leader not available; authentication failed"
        );
    }
}
