use std::time::Duration;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

pub const PRODUCER_QUEUE_MESSAGES: &str = "kafka_producer_queue_messages";
pub const PRODUCER_QUEUE_BYTES: &str = "kafka_producer_queue_bytes";
pub const PRODUCER_SEND_ERRORS: &str = "kafka_producer_send_errors_total";

#[derive(Default)]
pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Called from the rdkafka main loop every statistics.interval.ms
        metrics::gauge!(PRODUCER_QUEUE_MESSAGES).set(stats.msg_cnt as f64);
        metrics::gauge!(PRODUCER_QUEUE_BYTES).set(stats.msg_size as f64);
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        );

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext)?;

    // "Ping" the Kafka brokers by requesting metadata
    match api.client().fetch_metadata(None, Duration::from_secs(15)) {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// A message headed for an arbitrary topic, as accepted by `Publisher::send_batch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    /// Raw key bytes, forwarded unchanged so partitioning matches the source
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Synchronous send primitive: both calls return once the broker has
/// acknowledged (or rejected) every message they were given.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<(), KafkaProduceError>;

    /// Sends every message, waits for all deliveries and returns the first failure.
    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<(), KafkaProduceError>;
}

pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaPublisher {
    pub fn new(producer: FutureProducer<KafkaContext>) -> Self {
        Self { producer }
    }

    pub async fn from_config(config: &KafkaConfig) -> Result<Self, KafkaError> {
        Ok(Self::new(create_kafka_producer(config).await?))
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn send(&self, topic: &str, payload: &[u8]) -> Result<(), KafkaProduceError> {
        let record: FutureRecord<'_, str, [u8]> = FutureRecord {
            topic,
            key: None,
            payload: Some(payload),
            timestamp: None,
            partition: None,
            headers: None,
        };

        let delivery = match self.producer.send_result(record) {
            Ok(f) => f,
            Err((e, _)) => {
                metrics::counter!(PRODUCER_SEND_ERRORS, "topic" => topic.to_string()).increment(1);
                return Err(KafkaProduceError::KafkaProduceError { error: e });
            }
        };

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => {
                metrics::counter!(PRODUCER_SEND_ERRORS, "topic" => topic.to_string()).increment(1);
                Err(KafkaProduceError::KafkaProduceError { error: e })
            }
            Err(_) => Err(KafkaProduceError::KafkaProduceCanceled),
        }
    }

    async fn send_batch(&self, messages: &[OutboundMessage]) -> Result<(), KafkaProduceError> {
        let mut results = Vec::with_capacity(messages.len());
        let mut handles = Vec::with_capacity(messages.len());

        for (index, message) in messages.iter().enumerate() {
            let record: FutureRecord<'_, [u8], [u8]> = FutureRecord {
                topic: &message.topic,
                key: message.key.as_deref(),
                payload: Some(message.payload.as_slice()),
                timestamp: None,
                partition: None,
                headers: None,
            };

            match self.producer.send_result(record) {
                Ok(f) => handles.push((index, f)),
                Err((e, _)) => {
                    results.push((index, Err(KafkaProduceError::KafkaProduceError { error: e })))
                }
            }
        }

        for (index, future_handle) in handles {
            match future_handle.await {
                Ok(Ok(_)) => results.push((index, Ok(()))),
                Ok(Err((e, _))) => results.push((
                    index,
                    Err(KafkaProduceError::KafkaProduceError { error: e }),
                )),
                Err(_) => results.push((index, Err(KafkaProduceError::KafkaProduceCanceled))),
            }
        }

        // Report failures in passed-in order
        results.sort_by_key(|e| e.0);

        let failures = results.iter().filter(|(_, r)| r.is_err()).count();
        if failures > 0 {
            metrics::counter!(PRODUCER_SEND_ERRORS, "topic" => "batch").increment(failures as u64);
        }

        results
            .into_iter()
            .map(|(_, r)| r)
            .find(|r| r.is_err())
            .unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::create_mock_kafka;

    #[tokio::test]
    async fn test_send_to_mock_cluster() {
        let (cluster, publisher) = create_mock_kafka().await;
        cluster
            .create_topic("enrichment.test", 1, 1)
            .expect("failed to create topic");

        publisher
            .send("enrichment.test", b"unrecognized-pool-id")
            .await
            .expect("send should succeed");
    }

    #[tokio::test]
    async fn test_send_batch_to_several_topics() {
        let (cluster, publisher) = create_mock_kafka().await;
        cluster.create_topic("trades.test", 2, 1).unwrap();
        cluster.create_topic("pools.test", 1, 1).unwrap();

        let messages = vec![
            OutboundMessage::new("trades.test", b"a".to_vec()).with_key("pair-1"),
            OutboundMessage::new("trades.test", b"b".to_vec()).with_key("pair-2"),
            OutboundMessage::new("pools.test", b"c".to_vec()),
            OutboundMessage::new("pools.test", b"d".to_vec()).with_key(vec![0xff, 0xfe]),
        ];

        publisher
            .send_batch(&messages)
            .await
            .expect("batch send should succeed");
    }

    #[tokio::test]
    async fn test_send_empty_batch_is_ok() {
        let (_cluster, publisher) = create_mock_kafka().await;

        assert!(publisher.send_batch(&[]).await.is_ok());
    }

    #[test]
    fn test_outbound_message_builder() {
        let message = OutboundMessage::new("pools.dev", b"payload".to_vec()).with_key("k");

        assert_eq!(message.topic, "pools.dev");
        assert_eq!(message.key.as_deref(), Some(b"k".as_slice()));
        assert_eq!(message.payload, b"payload".to_vec());
    }
}
