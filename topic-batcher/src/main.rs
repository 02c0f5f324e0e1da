use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common_kafka::{ConsumerConfigBuilder, KafkaPublisher, Publisher};
use envconfig::Envconfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use topic_batcher::config::Config;
use topic_batcher::kafka::{ConsumerGroupController, ControllerSettings};
use topic_batcher::relay::RelayHandler;
use topic_batcher::server::{router, serve, setup_metrics_recorder};
use topic_batcher::{HandlerRegistry, ProgressTracker};

fn build_registry(config: &Config, relay: Arc<RelayHandler>) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new(config.default_batch_policy())
        .with_overrides(config.policy_overrides());

    for topic in config.immediate_topics() {
        registry.register_immediate(topic, relay.clone());
    }
    for topic in config.batch_topics() {
        registry.register_batch(topic, relay.clone(), None, None, None);
    }

    registry
}

fn start_server(
    config: &Config,
    controller: Arc<ConsumerGroupController>,
) -> Result<JoinHandle<()>> {
    let recorder = setup_metrics_recorder()?;
    let router = router(controller, Some(recorder));
    let bind = config.bind_address();

    Ok(tokio::task::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("Status server failed on {bind}: {e:#}");
        }
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting topic batcher service");

    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;
    config.validate().context("Invalid configuration")?;

    let publisher: Arc<dyn Publisher> = Arc::new(
        KafkaPublisher::from_config(&config.kafka)
            .await
            .context("Failed to create kafka producer")?,
    );
    let relay = Arc::new(RelayHandler::new(publisher, config.relay_topic()));

    let registry = Arc::new(build_registry(&config, relay));
    info!(topics = ?registry.topics(), "Handlers registered");

    let client_config = ConsumerConfigBuilder::from_config(&config.kafka, &config.consumer).build();
    let controller = Arc::new(ConsumerGroupController::new(
        client_config,
        registry,
        Arc::new(ProgressTracker::new()),
        ControllerSettings {
            claim: config.claim_settings(),
            join_retry: config.join_retry_policy(),
            channel_capacity: config.partition_channel_capacity,
            overflow_check_interval: config.overflow_check_interval(),
            drain_timeout: config.shutdown_timeout(),
        },
    ));

    let server_handle = start_server(&config, controller.clone())?;
    info!("Started status server on {}", config.bind_address());

    let stop = CancellationToken::new();
    let mut consumer_handle = {
        let controller = controller.clone();
        let stop = stop.clone();
        tokio::spawn(async move { controller.run(stop).await })
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for ctrl+c signal")?;
        }
        finished = &mut consumer_handle => {
            server_handle.abort();
            return finished.context("Consumer task panicked")?;
        }
    }

    info!("Received shutdown signal, shutting down gracefully...");
    stop.cancel();

    // the controller bounds its own drain by the same timeout
    let wait = config.shutdown_timeout() + Duration::from_secs(5);
    match tokio::time::timeout(wait, consumer_handle).await {
        Ok(Ok(Ok(_))) => info!("Consumer stopped normally"),
        Ok(Ok(Err(e))) => error!("Consumer stopped with error: {e:#}"),
        Ok(Err(e)) => error!("Consumer task panicked: {e:#}"),
        Err(_) => error!("Consumer shutdown timed out after {wait:?}"),
    }

    server_handle.abort();
    info!("Topic batcher service stopped");

    Ok(())
}
