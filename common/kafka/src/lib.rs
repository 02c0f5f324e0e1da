pub mod config;
pub mod kafka_producer;

pub use config::{ConsumerConfig, ConsumerConfigBuilder, KafkaConfig};
pub use kafka_producer::{KafkaProduceError, KafkaPublisher, OutboundMessage, Publisher};
