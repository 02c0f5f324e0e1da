use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rdkafka::message::{BorrowedMessage, Message};

use crate::kafka::types::Partition;

/// An owned copy of one delivered message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    topic: String,
    partition: i32,
    offset: i64,
    key: Option<Vec<u8>>,
    value: Vec<u8>,
    timestamp: Option<SystemTime>,
}

impl Record {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Vec<u8>>,
        value: Vec<u8>,
        timestamp: Option<SystemTime>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            value,
            timestamp,
        }
    }

    /// Copies a message out of the consumer's buffer. A missing payload
    /// becomes an empty value so tombstones still reach their handler.
    pub fn from_borrowed_message(msg: &BorrowedMessage<'_>) -> Self {
        let timestamp = msg
            .timestamp()
            .to_millis()
            .filter(|millis| *millis >= 0)
            .map(|millis| UNIX_EPOCH + Duration::from_millis(millis as u64));

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
            timestamp,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn timestamp(&self) -> Option<SystemTime> {
        self.timestamp
    }

    pub fn topic_partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}
