use std::time::Duration;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

use crate::error::ConfigError;
use crate::kafka::claim_loop::ClaimSettings;
use crate::policy::{BatchPolicy, TopicPolicyOverrides};
use crate::retry::{Backoff, RetryPolicy};

/// What a claim loop does with a record whose immediate handler failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ImmediateFailureMode {
    /// Log and move on; the record is not marked
    #[default]
    Skip,
    /// Retry with the batch retry policy, then behave like `Skip`
    Retry,
    /// Log, then mark and commit anyway (at-most-once for that record).
    /// Progress still reports the last record that was handled successfully.
    Commit,
}

impl ImmediateFailureMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImmediateFailureMode::Skip => "skip",
            ImmediateFailureMode::Retry => "retry",
            ImmediateFailureMode::Commit => "commit",
        }
    }
}

impl std::str::FromStr for ImmediateFailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "skip" => Ok(ImmediateFailureMode::Skip),
            "retry" => Ok(ImmediateFailureMode::Retry),
            "commit" => Ok(ImmediateFailureMode::Commit),
            _ => Err(format!("Unknown immediate failure mode: {s}")),
        }
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    // Suffix for every logical topic name: <logical>.<env>. Empty keeps names as they are
    #[envconfig(default = "dev")]
    pub topic_env: String,

    // Comma separated logical topic names bound to the relay handler
    #[envconfig(default = "")]
    pub immediate_topics: String,

    #[envconfig(default = "")]
    pub batch_topics: String,

    // Logical topic the relay handler republishes to; unset means records are only counted
    pub relay_topic: Option<String>,

    #[envconfig(default = "100")]
    pub batch_max_size: usize,

    #[envconfig(default = "50")]
    pub batch_min_size: usize,

    #[envconfig(default = "5000")]
    pub batch_timeout_ms: u64,

    // topic:max:min:timeout_ms entries separated by commas, keyed by logical topic name
    #[envconfig(default = "")]
    pub batch_policy_overrides: TopicPolicyOverrides,

    #[envconfig(default = "20")]
    pub status_interval_secs: u64,

    // How often a claim loop retries flushing a full batch that failed to flush
    #[envconfig(default = "5000")]
    pub stall_retry_interval_ms: u64,

    #[envconfig(default = "3")]
    pub batch_max_attempts: u32,

    #[envconfig(default = "1000")] // linear: 1s, 2s, ...
    pub batch_retry_interval_ms: u64,

    #[envconfig(default = "1000")]
    pub join_retry_initial_ms: u64,

    #[envconfig(default = "30000")]
    pub join_retry_max_ms: u64,

    // Unset retries joining until stopped
    pub join_max_attempts: Option<u32>,

    #[envconfig(default = "skip")]
    pub immediate_failure_mode: ImmediateFailureMode,

    #[envconfig(default = "1000")]
    pub partition_channel_capacity: usize,

    #[envconfig(default = "100")]
    pub overflow_check_interval_ms: u64,

    #[envconfig(default = "30")] // 30 seconds
    pub shutdown_timeout_secs: u64,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8080")]
    pub port: u16,
}

impl Config {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `<logical>.<env>`, or the logical name alone when no environment is set
    pub fn resolve_topic(&self, logical: &str) -> String {
        resolve_topic(logical, &self.topic_env)
    }

    pub fn immediate_topics(&self) -> Vec<String> {
        self.resolve_list(&self.immediate_topics)
    }

    pub fn batch_topics(&self) -> Vec<String> {
        self.resolve_list(&self.batch_topics)
    }

    pub fn relay_topic(&self) -> Option<String> {
        self.relay_topic
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| self.resolve_topic(t))
    }

    fn resolve_list(&self, raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(|t| self.resolve_topic(t))
            .collect()
    }

    pub fn default_batch_policy(&self) -> BatchPolicy {
        BatchPolicy::new(
            self.batch_max_size,
            self.batch_min_size,
            Duration::from_millis(self.batch_timeout_ms),
        )
    }

    /// Overrides re-keyed by broker topic name
    pub fn policy_overrides(&self) -> TopicPolicyOverrides {
        self.batch_policy_overrides
            .clone()
            .map_topics(|logical| self.resolve_topic(logical))
    }

    pub fn batch_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::build(
            Backoff::Linear,
            Duration::from_millis(self.batch_retry_interval_ms),
        )
        .max_attempts(self.batch_max_attempts)
        .provide()
    }

    pub fn join_retry_policy(&self) -> RetryPolicy {
        let builder = RetryPolicy::build(
            Backoff::Exponential { coefficient: 2 },
            Duration::from_millis(self.join_retry_initial_ms),
        )
        .maximum_interval(Duration::from_millis(self.join_retry_max_ms));

        match self.join_max_attempts {
            Some(attempts) => builder.max_attempts(attempts).provide(),
            None => builder.unbounded().provide(),
        }
    }

    pub fn claim_settings(&self) -> ClaimSettings {
        ClaimSettings {
            status_interval: Duration::from_secs(self.status_interval_secs),
            stall_retry_interval: Duration::from_millis(self.stall_retry_interval_ms),
            batch_retry: self.batch_retry_policy(),
            immediate_failure: self.immediate_failure_mode,
        }
    }

    pub fn overflow_check_interval(&self) -> Duration {
        Duration::from_millis(self.overflow_check_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.default_batch_policy().validate("defaults")?;

        for (topic, policy) in self.batch_policy_overrides.iter() {
            let resolved = BatchPolicy::new(
                policy.max_batch_size.unwrap_or(self.batch_max_size),
                policy.min_batch_size.unwrap_or(self.batch_min_size),
                policy
                    .batch_timeout
                    .unwrap_or(Duration::from_millis(self.batch_timeout_ms)),
            );
            // only an explicit minimum above the maximum is an error, defaults get clamped
            if policy.min_batch_size.is_some() {
                resolved.validate(topic)?;
            }
        }

        let positive = [
            ("STATUS_INTERVAL_SECS", self.status_interval_secs),
            ("STALL_RETRY_INTERVAL_MS", self.stall_retry_interval_ms),
            ("BATCH_MAX_ATTEMPTS", u64::from(self.batch_max_attempts)),
            ("PARTITION_CHANNEL_CAPACITY", self.partition_channel_capacity as u64),
            ("OVERFLOW_CHECK_INTERVAL_MS", self.overflow_check_interval_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidSetting {
                    name: name.to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }

        if self.join_max_attempts == Some(0) {
            return Err(ConfigError::InvalidSetting {
                name: "JOIN_MAX_ATTEMPTS".to_string(),
                reason: "must be positive when set".to_string(),
            });
        }

        if self.consumer.kafka_consumer_group.trim().is_empty() {
            return Err(ConfigError::InvalidSetting {
                name: "KAFKA_CONSUMER_GROUP".to_string(),
                reason: "must not be empty".to_string(),
            });
        }

        Ok(())
    }
}

pub fn resolve_topic(logical: &str, env: &str) -> String {
    let env = env.trim();
    if env.is_empty() {
        logical.to_string()
    } else {
        format!("{logical}.{env}")
    }
}
