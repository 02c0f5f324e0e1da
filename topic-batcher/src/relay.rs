//! Relay handler bound to the configured topics by the binary.
//!
//! Immediate topics are republished one value at a time, batch topics with a
//! single `send_batch` per flush. Without a relay topic records are only
//! counted, which still exercises marking and progress.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use common_kafka::{OutboundMessage, Publisher};
use tracing::debug;

use crate::handler::{BatchHandler, ImmediateHandler};
use crate::kafka::metrics_consts::RELAY_RECORDS;
use crate::kafka::record::Record;

pub struct RelayHandler {
    publisher: Arc<dyn Publisher>,
    relay_topic: Option<String>,
}

impl RelayHandler {
    pub fn new(publisher: Arc<dyn Publisher>, relay_topic: Option<String>) -> Self {
        Self {
            publisher,
            relay_topic,
        }
    }

    fn count(&self, source: &str, outcome: &'static str, records: usize) {
        metrics::counter!(
            RELAY_RECORDS,
            "source" => source.to_string(),
            "outcome" => outcome
        )
        .increment(records as u64);
    }
}

#[async_trait]
impl ImmediateHandler for RelayHandler {
    async fn handle(&self, value: &[u8], topic: &str) -> Result<()> {
        let Some(relay_topic) = &self.relay_topic else {
            self.count(topic, "counted", 1);
            return Ok(());
        };

        let sent = self
            .publisher
            .send(relay_topic, value)
            .await
            .with_context(|| format!("failed to relay record from {topic} to {relay_topic}"));

        self.count(topic, if sent.is_ok() { "relayed" } else { "failed" }, 1);
        sent
    }
}

#[async_trait]
impl BatchHandler for RelayHandler {
    async fn handle(
        &self,
        topic: &str,
        records: &[Record],
        partition: i32,
        worker_id: usize,
    ) -> Result<()> {
        let Some(relay_topic) = &self.relay_topic else {
            self.count(topic, "counted", records.len());
            return Ok(());
        };

        let messages: Vec<OutboundMessage> = records
            .iter()
            .map(|record| {
                let message = OutboundMessage::new(relay_topic.as_str(), record.value());
                match record.key() {
                    Some(key) => message.with_key(key),
                    None => message,
                }
            })
            .collect();

        debug!(
            topic = topic,
            partition = partition,
            worker_id = worker_id,
            len = messages.len(),
            relay_topic = relay_topic.as_str(),
            "Relaying batch"
        );

        let sent = self
            .publisher
            .send_batch(&messages)
            .await
            .with_context(|| {
                format!(
                    "failed to relay batch of {} from {topic}:{partition} to {relay_topic}",
                    records.len()
                )
            });

        self.count(
            topic,
            if sent.is_ok() { "relayed" } else { "failed" },
            records.len(),
        );
        sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{record_at, RecordingPublisher};

    #[tokio::test]
    async fn test_immediate_relay_publishes_value() {
        let publisher = Arc::new(RecordingPublisher::default());
        let relay = RelayHandler::new(publisher.clone(), Some("discovery.dev".to_string()));

        ImmediateHandler::handle(&relay, b"pool-42", "entities.dev")
            .await
            .unwrap();

        assert_eq!(
            publisher.sent(),
            vec![OutboundMessage::new("discovery.dev", b"pool-42".to_vec())]
        );
    }

    #[tokio::test]
    async fn test_batch_relay_keeps_order_and_keys() {
        let publisher = Arc::new(RecordingPublisher::default());
        let relay = RelayHandler::new(publisher.clone(), Some("discovery.dev".to_string()));

        let records = vec![
            record_at("trades.dev", 0, 4),
            Record::new("trades.dev", 0, 5, Some(b"pair".to_vec()), b"5".to_vec(), None),
        ];
        BatchHandler::handle(&relay, "trades.dev", &records, 0, 1)
            .await
            .unwrap();

        assert_eq!(
            publisher.sent(),
            vec![
                OutboundMessage::new("discovery.dev", b"4".to_vec()),
                OutboundMessage::new("discovery.dev", b"5".to_vec()).with_key("pair"),
            ]
        );
    }

    #[tokio::test]
    async fn test_binary_keys_are_relayed_unchanged() {
        let publisher = Arc::new(RecordingPublisher::default());
        let relay = RelayHandler::new(publisher.clone(), Some("discovery.dev".to_string()));

        let key = vec![0xc3, 0x28, 0x00, 0xff];
        let records = vec![Record::new(
            "trades.dev",
            0,
            9,
            Some(key.clone()),
            b"9".to_vec(),
            None,
        )];
        BatchHandler::handle(&relay, "trades.dev", &records, 0, 1)
            .await
            .unwrap();

        let sent = publisher.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].key, Some(key));
    }

    #[tokio::test]
    async fn test_publisher_failure_fails_the_handler() {
        let publisher = Arc::new(RecordingPublisher::failing());
        let relay = RelayHandler::new(publisher.clone(), Some("discovery.dev".to_string()));

        let result = BatchHandler::handle(&relay, "trades.dev", &[record_at("trades.dev", 0, 1)], 0, 1).await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_without_relay_topic_nothing_is_published() {
        let publisher = Arc::new(RecordingPublisher::default());
        let relay = RelayHandler::new(publisher.clone(), None);

        ImmediateHandler::handle(&relay, b"x", "entities.dev")
            .await
            .unwrap();
        BatchHandler::handle(&relay, "trades.dev", &[record_at("trades.dev", 0, 1)], 0, 1)
            .await
            .unwrap();

        assert!(publisher.sent().is_empty());
    }
}
