use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rdkafka::consumer::{BaseConsumer, ConsumerContext, Rebalance};
use rdkafka::error::KafkaResult;
use rdkafka::{ClientContext, Statistics, TopicPartitionList};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::kafka::claim_loop::ClaimExit;
use crate::kafka::metrics_consts::{REBALANCE_EMPTY_SKIPPED, REBALANCE_EVENTS};
use crate::kafka::router::PartitionRouter;
use crate::kafka::session::{GroupClient, KafkaGroupClient, SessionSlot};
use crate::kafka::types::partitions_from_list;

/// Consumer context driving session start and end from rebalance callbacks.
///
/// Revocation runs before the partitions are handed back, so claim loops can
/// still mark and commit while they drain. The callback blocks the consumer
/// task for at most `drain_timeout` to allow that.
pub struct GroupContext {
    router: Arc<PartitionRouter>,
    sessions: Arc<SessionSlot>,
    client: Arc<KafkaGroupClient>,
    drain_timeout: Duration,
}

impl GroupContext {
    pub fn new(
        router: Arc<PartitionRouter>,
        sessions: Arc<SessionSlot>,
        client: Arc<KafkaGroupClient>,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            router,
            sessions,
            client,
            drain_timeout,
        }
    }

    fn wait_for_drain(&self, tasks: Vec<JoinHandle<ClaimExit>>) {
        if tasks.is_empty() {
            return;
        }

        let handle = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => handle,
            _ => {
                // block_in_place needs a multi-threaded runtime; loops finish draining on their own
                warn!(
                    count = tasks.len(),
                    "Cannot wait for claim loops to drain on this runtime"
                );
                return;
            }
        };

        let count = tasks.len();
        let timeout = self.drain_timeout;
        let drained = tokio::task::block_in_place(|| {
            handle.block_on(async { tokio::time::timeout(timeout, join_all(tasks)).await })
        });

        match drained {
            Ok(_) => info!(count = count, "Revoked claim loops drained"),
            Err(_) => warn!(
                count = count,
                "Revoked claim loops did not drain within {timeout:?}"
            ),
        }
    }

    fn on_revoke(&self, list: &TopicPartitionList) {
        if list.count() == 0 {
            debug!("Skipping empty revoke rebalance");
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "revoke").increment(1);
            return;
        }
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "revoke").increment(1);

        let partitions = partitions_from_list(list);
        info!(count = partitions.len(), "Partitions revoked");

        let tasks = self.router.revoke(&partitions);
        self.wait_for_drain(tasks);

        if self.router.claimed_partitions().is_empty() {
            self.sessions.end_session();
        }
    }

    fn on_assign(&self, list: &TopicPartitionList) {
        if list.count() == 0 {
            debug!("Skipping empty assign rebalance");
            metrics::counter!(REBALANCE_EMPTY_SKIPPED, "event_type" => "assign").increment(1);
            return;
        }
        metrics::counter!(REBALANCE_EVENTS, "event_type" => "assign").increment(1);

        let partitions = partitions_from_list(list);
        let client: Arc<dyn GroupClient> = self.client.clone();
        match self.sessions.live_or_begin(&client) {
            Some(session) => self.router.assign(&session, &partitions),
            None => warn!(
                count = partitions.len(),
                "Ignoring assignment while draining"
            ),
        }
    }
}

impl ClientContext for GroupContext {
    // every statistics.interval.ms, from the rdkafka main loop
    fn stats(&self, stats: Statistics) {
        self.client.update_watermarks(&stats);
    }
}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => self.on_revoke(partitions),
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!("Rebalance error: {e}");
                metrics::counter!(REBALANCE_EVENTS, "event_type" => "error").increment(1);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            self.on_assign(partitions);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        match result {
            Ok(_) => debug!("Committed offsets for {} partitions", offsets.count()),
            Err(e) => warn!("Failed to commit offsets: {e}"),
        }
    }
}
