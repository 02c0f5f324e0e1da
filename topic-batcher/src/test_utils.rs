//! In-memory stand-ins for the broker and for handlers, shared by unit and
//! integration tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use common_kafka::{KafkaProduceError, OutboundMessage, Publisher};
use tokio::time::Instant;

use crate::error::BrokerError;
use crate::handler::{BatchHandler, ImmediateHandler};
use crate::kafka::record::Record;
use crate::kafka::session::GroupClient;
use crate::kafka::types::Partition;

/// Record whose value is the offset rendered as text
pub fn record_at(topic: &str, partition: i32, offset: i64) -> Record {
    Record::new(
        topic,
        partition,
        offset,
        None,
        offset.to_string().into_bytes(),
        None,
    )
}

#[derive(Default)]
pub struct InMemoryGroupClient {
    marked: Mutex<Vec<(Partition, i64)>>,
    commits: AtomicUsize,
    high_watermarks: Mutex<HashMap<Partition, i64>>,
    paused: Mutex<HashSet<Partition>>,
    fail_marks: AtomicBool,
}

impl InMemoryGroupClient {
    pub fn marked_offsets(&self, topic: &str, partition: i32) -> Vec<i64> {
        let key = Partition::new(topic, partition);
        self.marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(p, _)| *p == key)
            .map(|(_, offset)| *offset)
            .collect()
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn set_high_watermark(&self, partition: Partition, offset: i64) {
        self.high_watermarks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition, offset);
    }

    pub fn is_paused(&self, partition: &Partition) -> bool {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(partition)
    }

    pub fn fail_marks(&self, fail: bool) {
        self.fail_marks.store(fail, Ordering::SeqCst);
    }
}

impl GroupClient for InMemoryGroupClient {
    fn mark(&self, record: &Record) -> Result<(), BrokerError> {
        if self.fail_marks.load(Ordering::SeqCst) {
            return Err(BrokerError::ConsumerGone);
        }
        self.marked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((record.topic_partition(), record.offset()));
        Ok(())
    }

    fn commit(&self) -> Result<(), BrokerError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn high_watermark(&self, partition: &Partition) -> Option<i64> {
        self.high_watermarks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .copied()
    }

    fn pause(&self, partition: &Partition) -> Result<(), BrokerError> {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition.clone());
        Ok(())
    }

    fn resume(&self, partition: &Partition) -> Result<(), BrokerError> {
        self.paused
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(partition);
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BatchCall {
    pub topic: String,
    pub partition: i32,
    pub worker_id: usize,
    pub offsets: Vec<i64>,
    pub at: Instant,
    pub succeeded: bool,
}

/// Records every invocation; fails the first `failures` calls, or all of them.
#[derive(Default)]
pub struct RecordingBatchHandler {
    calls: Mutex<Vec<BatchCall>>,
    failures: AtomicUsize,
    always_fail: AtomicBool,
}

impl RecordingBatchHandler {
    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self {
            always_fail: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn recover(&self) {
        self.always_fail.store(false, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BatchCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn successful_calls(&self) -> Vec<BatchCall> {
        self.calls().into_iter().filter(|c| c.succeeded).collect()
    }

    /// Offsets handed to successful calls, in call order
    pub fn handled_offsets(&self) -> Vec<i64> {
        self.successful_calls()
            .into_iter()
            .flat_map(|c| c.offsets)
            .collect()
    }

    fn should_fail(&self) -> bool {
        if self.always_fail.load(Ordering::SeqCst) {
            return true;
        }
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl BatchHandler for RecordingBatchHandler {
    async fn handle(
        &self,
        topic: &str,
        records: &[Record],
        partition: i32,
        worker_id: usize,
    ) -> Result<()> {
        let failing = self.should_fail();
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(BatchCall {
                topic: topic.to_string(),
                partition,
                worker_id,
                offsets: records.iter().map(Record::offset).collect(),
                at: Instant::now(),
                succeeded: !failing,
            });

        if failing {
            bail!("batch handler failure injected for {topic}");
        }
        Ok(())
    }
}

/// Records every value; fails for values registered with `fail_on`.
#[derive(Default)]
pub struct RecordingImmediateHandler {
    calls: Mutex<Vec<(String, Vec<u8>)>>,
    failing_values: Mutex<HashSet<Vec<u8>>>,
    failures: AtomicUsize,
}

impl RecordingImmediateHandler {
    pub fn fail_on(self, value: impl Into<Vec<u8>>) -> Self {
        self.failing_values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(value.into());
        self
    }

    pub fn failing_times(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<u8>)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ImmediateHandler for RecordingImmediateHandler {
    async fn handle(&self, value: &[u8], topic: &str) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((topic.to_string(), value.to_vec()));

        let listed = self
            .failing_values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(value);
        let counted = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if listed || counted {
            bail!("immediate handler failure injected for {topic}");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    sent: Mutex<Vec<OutboundMessage>>,
    fail: bool,
}

impl RecordingPublisher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Publisher for RecordingPublisher {
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<(), KafkaProduceError> {
        self.send_batch(&[OutboundMessage::new(topic, payload)])
            .await
    }

    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<(), KafkaProduceError> {
        if self.fail {
            return Err(KafkaProduceError::KafkaProduceCanceled);
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(messages);
        Ok(())
    }
}
