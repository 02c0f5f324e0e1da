use rdkafka::error::KafkaError;
use thiserror::Error;

/// Failures of the per-record broker primitives used by claim loops
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("consumer is gone")]
    ConsumerGone,
}

#[derive(Error, Debug)]
pub enum FlushError {
    #[error("batch handler for {topic} failed after {attempts} attempts: {source:#}")]
    Exhausted {
        topic: String,
        attempts: u32,
        source: anyhow::Error,
    },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid batch policy override '{entry}': {reason}")]
    InvalidOverride { entry: String, reason: String },
    #[error("invalid batch policy for {scope}: {reason}")]
    InvalidPolicy { scope: String, reason: String },
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },
}
