use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdkafka::message::{BorrowedMessage, Message, OwnedHeaders};
use rdkafka::topic_partition_list::TopicPartitionListElem;

/// Identifies a single partition of a topic. Key of a partition worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    topic: String,
    partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

impl From<TopicPartitionListElem<'_>> for TopicPartition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

/// The next offset to consume for a partition, as committed to the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: TopicPartition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: TopicPartition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// An owned record fetched from the broker. Never mutated after fetch.
#[derive(Debug, Clone)]
pub struct Record {
    topic_partition: TopicPartition,
    offset: i64,
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    timestamp: SystemTime,
    headers: Option<OwnedHeaders>,
}

impl Record {
    pub fn new(
        topic_partition: TopicPartition,
        offset: i64,
        key: Option<Vec<u8>>,
        payload: Option<Vec<u8>>,
        timestamp: SystemTime,
    ) -> Self {
        Self {
            topic_partition,
            offset,
            key,
            payload,
            timestamp,
            headers: None,
        }
    }

    /// Copy a record out of a message borrowed from the consumer queue.
    ///
    /// Records without a broker timestamp get the time they were fetched.
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        let timestamp = msg
            .timestamp()
            .to_millis()
            .map(|ms| UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64))
            .unwrap_or_else(SystemTime::now);

        Self {
            topic_partition: TopicPartition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            payload: msg.payload().map(|p| p.to_vec()),
            timestamp,
            headers: msg.headers().map(|h| h.detach()),
        }
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.topic_partition
    }

    pub fn topic(&self) -> &str {
        self.topic_partition.topic()
    }

    pub fn partition(&self) -> i32 {
        self.topic_partition.partition()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn headers(&self) -> Option<&OwnedHeaders> {
        self.headers.as_ref()
    }

    /// Create a simple Record for testing purposes
    pub fn new_for_test(topic_partition: TopicPartition, offset: i64, payload: &str) -> Self {
        Self::new(
            topic_partition,
            offset,
            None,
            Some(payload.as_bytes().to_vec()),
            SystemTime::now(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_topic_partition_equality_needs_both_fields() {
        let a = TopicPartition::new("emails", 0);

        assert_eq!(a, TopicPartition::new("emails".to_string(), 0));
        assert_ne!(a, TopicPartition::new("emails", 1));
        assert_ne!(a, TopicPartition::new("chat", 0));

        let set: HashSet<_> = [a.clone(), a.clone(), TopicPartition::new("emails", 1)]
            .into_iter()
            .collect();
        assert_eq!(set.len(), 2);
        assert_eq!(a.to_string(), "emails:0");
    }

    #[test]
    fn test_record_accessors() {
        let record = Record::new(
            TopicPartition::new("inbound-emails", 2),
            42,
            Some(b"thread-1".to_vec()),
            Some(b"Subject: hi".to_vec()),
            UNIX_EPOCH + Duration::from_millis(1_700_000_000_000),
        );

        assert_eq!(record.topic(), "inbound-emails");
        assert_eq!(record.partition(), 2);
        assert_eq!(record.offset(), 42);
        assert_eq!(record.key(), Some(&b"thread-1"[..]));
        assert_eq!(record.payload(), Some(&b"Subject: hi"[..]));
        assert!(record.headers().is_none());
    }
}
