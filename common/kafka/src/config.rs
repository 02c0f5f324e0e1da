use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "topic-batcher")]
    pub kafka_consumer_group: String,

    // We default to "earliest" for this, but if you're bringing up a new service, you probably want "latest"
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "30000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "3000")]
    pub kafka_heartbeat_interval_ms: u32,

    // Upper bound on time between polls; a slow batch handler must finish well inside it
    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,
}

/// Builds the rdkafka `ClientConfig` for a group consumer whose offsets are
/// stored and committed explicitly by the application.
///
/// Sets: enable.auto.offset.store=false, enable.auto.commit=false and the
/// session/heartbeat/max.poll defaults. Every setting can be overridden with
/// the `with_*` methods or `set` before calling `build`.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn for_group_consumer(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("statistics.interval.ms", "10000");

        Self { config }
    }

    /// Builder seeded from the environment-driven connection and group settings.
    pub fn from_config(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> Self {
        Self::for_group_consumer(&kafka.kafka_hosts, &consumer.kafka_consumer_group)
            .with_tls(kafka.kafka_tls)
            .offset_reset(&consumer.kafka_consumer_offset_reset)
            .session_timeout_ms(consumer.kafka_session_timeout_ms)
            .heartbeat_interval_ms(consumer.kafka_heartbeat_interval_ms)
            .max_poll_interval_ms(consumer.kafka_max_poll_interval_ms)
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    pub fn session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    pub fn heartbeat_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("heartbeat.interval.ms", ms.to_string());
        self
    }

    pub fn max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
