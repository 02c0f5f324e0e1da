use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::ClientConfig;
use tokio::runtime::Handle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::handler::HandlerRegistry;
use crate::kafka::claim_loop::ClaimSettings;
use crate::kafka::context::GroupContext;
use crate::kafka::metrics_consts::{BROKER_ERRORS, JOIN_RETRIES, RECORDS_RECEIVED};
use crate::kafka::record::Record;
use crate::kafka::router::PartitionRouter;
use crate::kafka::session::{
    ControllerState, GroupClient, KafkaGroupClient, SessionSlot, SessionStatus,
};
use crate::progress::{ProgressEntry, ProgressTracker};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub claim: ClaimSettings,
    pub join_retry: RetryPolicy,
    pub channel_capacity: usize,
    pub overflow_check_interval: Duration,
    /// Upper bound on waiting for claim loops to drain, on revoke and on stop
    pub drain_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ControllerStatus {
    #[serde(flatten)]
    pub session: SessionStatus,
    pub progress: Vec<ProgressEntry>,
}

/// Joins the consumer group for the registry's topic set and keeps claiming
/// until stopped. Broker failures tear the consumer down and join again
/// under `join_retry`.
pub struct ConsumerGroupController {
    client_config: ClientConfig,
    registry: Arc<HandlerRegistry>,
    progress: Arc<ProgressTracker>,
    sessions: Arc<SessionSlot>,
    settings: ControllerSettings,
}

impl ConsumerGroupController {
    pub fn new(
        client_config: ClientConfig,
        registry: Arc<HandlerRegistry>,
        progress: Arc<ProgressTracker>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            client_config,
            registry,
            progress,
            sessions: Arc::new(SessionSlot::new()),
            settings,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.sessions.state()
    }

    pub fn status(&self) -> ControllerStatus {
        ControllerStatus {
            session: self.sessions.status(),
            progress: self.progress.snapshot(),
        }
    }

    /// Runs until `stop` is cancelled or the join policy gives up.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        if self.registry.is_empty() {
            self.sessions.transition(ControllerState::Closed);
            anyhow::bail!("no handlers registered, nothing to consume");
        }

        let mut attempts: u32 = 0;
        let result = loop {
            self.sessions.transition(ControllerState::Joining);
            let generation_before = self.sessions.status().generation;

            let claimed = self.join_and_claim(&stop).await;

            if stop.is_cancelled() {
                if let Err(e) = claimed {
                    warn!("Consumer stopped with error: {e:#}");
                }
                break Ok(());
            }

            let e = match claimed {
                Ok(()) => break Ok(()),
                Err(e) => e,
            };

            // a session that got as far as claiming starts the backoff over
            if self.sessions.status().generation > generation_before {
                attempts = 0;
            }
            attempts += 1;
            metrics::counter!(JOIN_RETRIES).increment(1);

            if !self.settings.join_retry.should_retry(attempts) {
                error!(attempts = attempts, "Giving up on consumer group: {e:#}");
                break Err(e.context(format!("consumer group failed after {attempts} attempts")));
            }

            let wait = self.settings.join_retry.retry_interval(attempts);
            error!(
                attempt = attempts,
                retry_in_ms = wait.as_millis() as u64,
                "Consumer group session failed, rejoining: {e:#}"
            );

            tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                _ = sleep(wait) => {}
            }
        };

        self.sessions.transition(ControllerState::Closed);
        info!("Consumer group controller closed");
        result
    }

    async fn join_and_claim(&self, stop: &CancellationToken) -> Result<()> {
        let kafka_client = Arc::new(KafkaGroupClient::unbound());
        let client: Arc<dyn GroupClient> = kafka_client.clone();

        let router = Arc::new(PartitionRouter::new(
            self.registry.clone(),
            self.progress.clone(),
            self.sessions.clone(),
            client,
            self.settings.claim.clone(),
            self.settings.channel_capacity,
            Handle::current(),
        ));
        let context = GroupContext::new(
            router.clone(),
            self.sessions.clone(),
            kafka_client.clone(),
            self.settings.drain_timeout,
        );

        let consumer: StreamConsumer<GroupContext> = self
            .client_config
            .create_with_context(context)
            .context("failed to create kafka consumer")?;
        let consumer = Arc::new(consumer);
        kafka_client.bind(&consumer);

        let topics = self.registry.topics();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .context("failed to subscribe to topics")?;
        info!(topics = ?topics, "Joined consumer group");

        let claimed = self.claim(&consumer, &router, stop).await;

        self.sessions.transition(ControllerState::Draining);
        router.shutdown(self.settings.drain_timeout).await;
        if let Err(e) = kafka_client.commit_sync() {
            warn!("Final offset commit failed: {e}");
        }
        consumer.unsubscribe();
        self.sessions.end_session();

        claimed
    }

    async fn claim(
        &self,
        consumer: &StreamConsumer<GroupContext>,
        router: &PartitionRouter,
        stop: &CancellationToken,
    ) -> Result<()> {
        let mut overflow_check = interval(self.settings.overflow_check_interval);
        overflow_check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_errors: u32 = 0;

        loop {
            // the borrowed message must not live across an await
            let received = tokio::select! {
                biased;

                _ = stop.cancelled() => {
                    info!("Stop requested, leaving consumer group");
                    return Ok(());
                }

                _ = overflow_check.tick() => {
                    router.pump_overflow();
                    continue;
                }

                message = consumer.recv() => message.map(|m| Record::from_borrowed_message(&m)),
            };

            match received {
                Ok(record) => {
                    consecutive_errors = 0;
                    metrics::counter!(RECORDS_RECEIVED, "topic" => record.topic().to_string())
                        .increment(1);
                    router.route(record);
                }
                Err(e) => {
                    consecutive_errors = consecutive_errors.saturating_add(1);
                    if let Some(fatal) = handle_kafka_error(e, consecutive_errors).await {
                        return Err(fatal).context("fatal consumer error");
                    }
                }
            }
        }
    }
}

/// What the claim phase does after a consumer error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorAction {
    /// Keep polling once `backoff` has passed
    Continue {
        class: &'static str,
        backoff: Duration,
    },
    /// Tear the consumer down and go back to the join loop
    Rejoin { class: &'static str },
}

/// `consecutive` counts errors since the last delivered record; backoffs grow
/// with it up to a per-class cap.
fn classify(e: &KafkaError, consecutive: u32) -> ErrorAction {
    let growing = |step: Duration, cap: u32| step * consecutive.clamp(1, cap);
    let keep_polling =
        |class: &'static str, backoff: Duration| ErrorAction::Continue { class, backoff };

    match e {
        KafkaError::MessageConsumption(
            RDKafkaErrorCode::PartitionEOF | RDKafkaErrorCode::OperationTimedOut,
        ) => keep_polling("idle", Duration::ZERO),
        // auto.offset.reset repositions the fetcher with the broker
        KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange) => {
            keep_polling("offset_out_of_range", Duration::from_millis(500))
        }
        KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownTopicOrPartition) => {
            keep_polling("unknown_topic", growing(Duration::from_secs(1), 5))
        }
        KafkaError::MessageConsumption(_) => {
            keep_polling("consumer", growing(Duration::from_millis(100), 10))
        }
        KafkaError::Global(
            RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure,
        ) => keep_polling("broker_unreachable", growing(Duration::from_secs(1), 5)),
        KafkaError::Global(RDKafkaErrorCode::Authentication) => ErrorAction::Rejoin {
            class: "authentication",
        },
        KafkaError::Global(_) => keep_polling("global", growing(Duration::from_millis(500), 6)),
        KafkaError::MessageConsumptionFatal(_) => ErrorAction::Rejoin { class: "fatal" },
        KafkaError::Canceled => ErrorAction::Rejoin { class: "canceled" },
        _ => keep_polling("unexpected", growing(Duration::from_millis(100), 10)),
    }
}

/// Returns the error back when the claim phase must end.
async fn handle_kafka_error(e: KafkaError, consecutive: u32) -> Option<KafkaError> {
    match classify(&e, consecutive) {
        ErrorAction::Continue { class, backoff } => {
            metrics::counter!(BROKER_ERRORS, "error" => class, "action" => "continue")
                .increment(1);
            if backoff.is_zero() {
                return None;
            }
            warn!(
                class = class,
                consecutive = consecutive,
                backoff_ms = backoff.as_millis() as u64,
                "Kafka consumer error: {e}"
            );
            sleep(backoff).await;
            None
        }
        ErrorAction::Rejoin { class } => {
            metrics::counter!(BROKER_ERRORS, "error" => class, "action" => "rejoin").increment(1);
            error!(class = class, "Kafka consumer error ends this session: {e}");
            Some(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use crate::test_utils::RecordingImmediateHandler;
    use tokio::time::Instant;

    fn settings(join_retry: RetryPolicy) -> ControllerSettings {
        ControllerSettings {
            claim: ClaimSettings::default(),
            join_retry,
            channel_capacity: 10,
            overflow_check_interval: Duration::from_millis(100),
            drain_timeout: Duration::from_secs(1),
        }
    }

    /// Consumer creation fails on every join attempt
    fn unusable_controller(join_retry: RetryPolicy) -> ConsumerGroupController {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", "localhost:9092")
            .set("group.id", "topic-batcher-tests")
            .set("no.such.property", "true");

        let mut registry = HandlerRegistry::default();
        registry.register_immediate("entities.dev", Arc::new(RecordingImmediateHandler::default()));

        ConsumerGroupController::new(
            client_config,
            Arc::new(registry),
            Arc::new(ProgressTracker::new()),
            settings(join_retry),
        )
    }

    #[test]
    fn test_idle_errors_continue_without_backoff() {
        for code in [RDKafkaErrorCode::PartitionEOF, RDKafkaErrorCode::OperationTimedOut] {
            assert_eq!(
                classify(&KafkaError::MessageConsumption(code), 4),
                ErrorAction::Continue {
                    class: "idle",
                    backoff: Duration::ZERO
                }
            );
        }
    }

    #[test]
    fn test_backoff_grows_with_consecutive_errors_up_to_a_cap() {
        let down = KafkaError::Global(RDKafkaErrorCode::AllBrokersDown);
        let backoff = |consecutive| match classify(&down, consecutive) {
            ErrorAction::Continue { backoff, .. } => backoff,
            ErrorAction::Rejoin { .. } => panic!("brokers being down is transient"),
        };

        assert_eq!(backoff(1), Duration::from_secs(1));
        assert_eq!(backoff(3), Duration::from_secs(3));
        assert_eq!(backoff(50), Duration::from_secs(5));
    }

    #[test]
    fn test_fatal_errors_rejoin() {
        let rejoin = [
            KafkaError::MessageConsumptionFatal(RDKafkaErrorCode::Fatal),
            KafkaError::Global(RDKafkaErrorCode::Authentication),
            KafkaError::Canceled,
        ];

        for e in rejoin {
            assert!(matches!(classify(&e, 1), ErrorAction::Rejoin { .. }), "{e:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_keep_claiming() {
        let transient = [
            KafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF),
            KafkaError::MessageConsumption(RDKafkaErrorCode::OffsetOutOfRange),
            KafkaError::MessageConsumption(RDKafkaErrorCode::UnknownTopicOrPartition),
            KafkaError::Global(RDKafkaErrorCode::BrokerTransportFailure),
        ];

        for e in transient {
            assert!(handle_kafka_error(e, 1).await.is_none());
        }
        assert!(handle_kafka_error(KafkaError::Canceled, 1).await.is_some());
    }

    #[tokio::test]
    async fn test_empty_registry_closes_immediately() {
        let controller = ConsumerGroupController::new(
            ClientConfig::new(),
            Arc::new(HandlerRegistry::default()),
            Arc::new(ProgressTracker::new()),
            settings(RetryPolicy::default()),
        );

        assert!(controller.run(CancellationToken::new()).await.is_err());
        assert_eq!(controller.state(), ControllerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_join_policy_gives_up() {
        let controller = unusable_controller(
            RetryPolicy::build(Backoff::Linear, Duration::from_secs(1))
                .max_attempts(3)
                .provide(),
        );

        let started = Instant::now();
        let result = controller.run(CancellationToken::new()).await;

        let e = result.expect_err("join attempts should be exhausted");
        assert!(format!("{e:#}").contains("after 3 attempts"), "{e:#}");
        assert!(format!("{e:#}").contains("failed to create kafka consumer"), "{e:#}");
        // waits of 1s and 2s between the three attempts
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(controller.state(), ControllerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_join_policy_retries_until_stopped() {
        let controller = Arc::new(unusable_controller(
            RetryPolicy::build(Backoff::Exponential { coefficient: 2 }, Duration::from_secs(1))
                .maximum_interval(Duration::from_secs(5))
                .unbounded()
                .provide(),
        ));
        let stop = CancellationToken::new();

        let task = tokio::spawn({
            let controller = controller.clone();
            let stop = stop.clone();
            async move { controller.run(stop).await }
        });

        sleep(Duration::from_secs(60)).await;
        assert!(!task.is_finished());
        assert_eq!(controller.state(), ControllerState::Joining);

        stop.cancel();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(controller.state(), ControllerState::Closed);
    }
}
