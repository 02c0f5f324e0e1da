//! Consumer sessions and the controller state they live in.
//!
//! A `Session` lasts from one partition assignment to the next revocation.
//! Claim loops keep the session they were started with; the controller only
//! ever exposes one live session, swapped as a whole under `SessionSlot`'s lock.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::Statistics;
use serde::Serialize;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::kafka::context::GroupContext;
use crate::kafka::metrics_consts::SESSION_GENERATION;
use crate::kafka::record::Record;
use crate::kafka::types::Partition;

/// Broker primitives a claim loop needs from the consumer it was started by.
pub trait GroupClient: Send + Sync {
    /// Client-side offset advance for `record`, not yet durable
    fn mark(&self, record: &Record) -> Result<(), BrokerError>;

    /// Makes every marked offset durable
    fn commit(&self) -> Result<(), BrokerError>;

    /// Last known high watermark, if the client has seen one
    fn high_watermark(&self, partition: &Partition) -> Option<i64>;

    fn pause(&self, partition: &Partition) -> Result<(), BrokerError>;

    fn resume(&self, partition: &Partition) -> Result<(), BrokerError>;
}

/// `GroupClient` over an rdkafka `StreamConsumer`.
///
/// The consumer owns the context, which owns the router, which owns this
/// client, so only a weak reference is held. It is bound once the consumer
/// has been created.
///
/// High watermarks come from the consumer's periodic statistics, so reading
/// them never goes to the broker.
#[derive(Default)]
pub struct KafkaGroupClient {
    consumer: OnceLock<Weak<StreamConsumer<GroupContext>>>,
    high_watermarks: RwLock<HashMap<Partition, i64>>,
}

impl KafkaGroupClient {
    pub fn unbound() -> Self {
        Self::default()
    }

    pub fn bind(&self, consumer: &Arc<StreamConsumer<GroupContext>>) {
        if self.consumer.set(Arc::downgrade(consumer)).is_err() {
            warn!("Group client already bound to a consumer, ignoring rebind");
        }
    }

    fn consumer(&self) -> Result<Arc<StreamConsumer<GroupContext>>, BrokerError> {
        self.consumer
            .get()
            .and_then(Weak::upgrade)
            .ok_or(BrokerError::ConsumerGone)
    }

    /// Blocking commit used once the claim loops have drained
    pub fn commit_sync(&self) -> Result<(), BrokerError> {
        match self.consumer()?.commit_consumer_state(CommitMode::Sync) {
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            other => other.map_err(BrokerError::from),
        }
    }

    /// Caches `hi_offset` for every partition in a statistics report
    pub fn update_watermarks(&self, stats: &Statistics) {
        let reported = stats.topics.iter().flat_map(|(topic, topic_stats)| {
            topic_stats
                .partitions
                .values()
                .map(move |p| (Partition::new(topic.as_str(), p.partition), p.hi_offset))
        });
        for (partition, hi_offset) in reported {
            self.record_high_watermark(partition, hi_offset);
        }
    }

    /// Ignores the internal unassigned partition (-1) and unknown offsets
    pub fn record_high_watermark(&self, partition: Partition, hi_offset: i64) {
        if partition.partition_number() < 0 || hi_offset < 0 {
            return;
        }
        self.high_watermarks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition, hi_offset);
    }
}

impl GroupClient for KafkaGroupClient {
    fn mark(&self, record: &Record) -> Result<(), BrokerError> {
        // the stored offset is the next one to consume
        self.consumer()?
            .store_offset(record.topic(), record.partition(), record.offset() + 1)?;
        Ok(())
    }

    fn commit(&self) -> Result<(), BrokerError> {
        match self.consumer()?.commit_consumer_state(CommitMode::Async) {
            // nothing marked since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            other => other.map_err(BrokerError::from),
        }
    }

    fn high_watermark(&self, partition: &Partition) -> Option<i64> {
        self.high_watermarks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .copied()
    }

    fn pause(&self, partition: &Partition) -> Result<(), BrokerError> {
        self.consumer()?
            .pause(&partition.to_topic_partition_list())?;
        Ok(())
    }

    fn resume(&self, partition: &Partition) -> Result<(), BrokerError> {
        self.consumer()?
            .resume(&partition.to_topic_partition_list())?;
        Ok(())
    }
}

pub struct Session {
    generation: u64,
    client: Arc<dyn GroupClient>,
    cancel: CancellationToken,
}

impl Session {
    pub fn new(generation: u64, client: Arc<dyn GroupClient>) -> Self {
        Self {
            generation,
            client,
            cancel: CancellationToken::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn client(&self) -> &dyn GroupClient {
        self.client.as_ref()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Token for a single claim loop: cancelled with the session, or on its own at revocation.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("generation", &self.generation)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Lifecycle of the consumer group controller.
///
/// ```text
/// Idle -> Joining -> Claiming -> (Rebalancing -> Claiming)* -> Draining -> Closed
/// ```
///
/// Broker errors send Claiming/Rebalancing back through Draining to Joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Joining,
    Claiming,
    Rebalancing,
    Draining,
    Closed,
}

impl ControllerState {
    pub fn can_transition_to(self, next: ControllerState) -> bool {
        use ControllerState as S;
        matches!(
            (self, next),
            (S::Idle, S::Joining)
                | (S::Idle, S::Closed)
                | (S::Joining, S::Joining)
                | (S::Joining, S::Claiming)
                | (S::Joining, S::Draining)
                | (S::Joining, S::Closed)
                | (S::Claiming, S::Rebalancing)
                | (S::Claiming, S::Draining)
                | (S::Rebalancing, S::Claiming)
                | (S::Rebalancing, S::Draining)
                | (S::Draining, S::Joining)
                | (S::Draining, S::Closed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Idle => "idle",
            ControllerState::Joining => "joining",
            ControllerState::Claiming => "claiming",
            ControllerState::Rebalancing => "rebalancing",
            ControllerState::Draining => "draining",
            ControllerState::Closed => "closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: ControllerState,
    pub generation: u64,
    pub live: bool,
}

struct SlotInner {
    state: ControllerState,
    generation: u64,
    session: Option<Arc<Session>>,
}

/// Controller state plus the single live session, guarded together so a
/// status read never sees one updated without the other.
pub struct SessionSlot {
    inner: RwLock<SlotInner>,
}

impl Default for SessionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSlot {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(SlotInner {
                state: ControllerState::Idle,
                generation: 0,
                session: None,
            }),
        }
    }

    pub fn state(&self) -> ControllerState {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state
    }

    /// Moves to `next`, returning the previous state. Transitions outside the
    /// lifecycle table are applied but logged.
    pub fn transition(&self, next: ControllerState) -> ControllerState {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let previous = inner.state;
        Self::set_state(&mut inner, next);
        previous
    }

    fn set_state(inner: &mut SlotInner, next: ControllerState) {
        if inner.state == next && next != ControllerState::Joining {
            return;
        }
        if !inner.state.can_transition_to(next) {
            warn!(
                from = inner.state.as_str(),
                to = next.as_str(),
                "Unexpected controller state transition"
            );
        } else {
            info!(
                from = inner.state.as_str(),
                to = next.as_str(),
                "Controller state changed"
            );
        }
        inner.state = next;
    }

    pub fn current(&self) -> Option<Arc<Session>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .session
            .clone()
    }

    /// Returns the live session, starting a new generation when there is none.
    /// No session is started once the controller is draining or closed.
    pub fn live_or_begin(&self, client: &Arc<dyn GroupClient>) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(session) = inner.session.as_ref().filter(|s| !s.is_cancelled()) {
            return Some(session.clone());
        }

        if matches!(
            inner.state,
            ControllerState::Draining | ControllerState::Closed
        ) {
            return None;
        }

        inner.generation += 1;
        let session = Arc::new(Session::new(inner.generation, client.clone()));
        if let Some(previous) = inner.session.replace(session.clone()) {
            previous.cancel();
        }
        Self::set_state(&mut inner, ControllerState::Claiming);

        info!(generation = inner.generation, "Consumer session started");
        metrics::gauge!(SESSION_GENERATION).set(inner.generation as f64);

        Some(session)
    }

    /// Cancels and forgets the live session. A claiming controller moves to
    /// rebalancing; other states are left alone.
    pub fn end_session(&self) -> Option<Arc<Session>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        let session = inner.session.take();
        if let Some(session) = &session {
            session.cancel();
            info!(generation = session.generation(), "Consumer session ended");
        }
        if inner.state == ControllerState::Claiming {
            Self::set_state(&mut inner, ControllerState::Rebalancing);
        }
        session
    }

    pub fn status(&self) -> SessionStatus {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        SessionStatus {
            state: inner.state,
            generation: inner.generation,
            live: inner
                .session
                .as_ref()
                .is_some_and(|session| !session.is_cancelled()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::InMemoryGroupClient;

    fn client() -> Arc<dyn GroupClient> {
        Arc::new(InMemoryGroupClient::default())
    }

    #[test]
    fn test_lifecycle_transitions() {
        use ControllerState as S;

        assert!(S::Idle.can_transition_to(S::Joining));
        assert!(S::Joining.can_transition_to(S::Claiming));
        assert!(S::Claiming.can_transition_to(S::Rebalancing));
        assert!(S::Rebalancing.can_transition_to(S::Claiming));
        assert!(S::Claiming.can_transition_to(S::Draining));
        assert!(S::Draining.can_transition_to(S::Closed));
        assert!(S::Draining.can_transition_to(S::Joining));

        assert!(!S::Idle.can_transition_to(S::Claiming));
        assert!(!S::Closed.can_transition_to(S::Joining));
        assert!(!S::Rebalancing.can_transition_to(S::Closed));
    }

    #[test]
    fn test_sessions_are_replaced_wholesale() {
        let slot = SessionSlot::new();
        let client = client();
        slot.transition(ControllerState::Joining);

        let first = slot.live_or_begin(&client).unwrap();
        assert_eq!(first.generation(), 1);
        assert_eq!(slot.state(), ControllerState::Claiming);

        // the live session is reused
        let same = slot.live_or_begin(&client).unwrap();
        assert!(Arc::ptr_eq(&first, &same));

        let ended = slot.end_session().unwrap();
        assert!(ended.is_cancelled());
        assert_eq!(slot.state(), ControllerState::Rebalancing);
        assert!(slot.current().is_none());

        let second = slot.live_or_begin(&client).unwrap();
        assert_eq!(second.generation(), 2);
        assert!(!second.is_cancelled());
        assert!(first.is_cancelled());
        assert_eq!(
            slot.status(),
            SessionStatus {
                state: ControllerState::Claiming,
                generation: 2,
                live: true,
            }
        );
    }

    #[test]
    fn test_no_session_while_draining() {
        let slot = SessionSlot::new();
        slot.transition(ControllerState::Joining);
        slot.transition(ControllerState::Draining);

        assert!(slot.live_or_begin(&client()).is_none());
        assert!(!slot.status().live);
    }

    #[test]
    fn test_high_watermarks_come_from_statistics() {
        let client = KafkaGroupClient::unbound();
        let partition = Partition::new("trades.dev", 3);
        assert_eq!(client.high_watermark(&partition), None);

        client.record_high_watermark(partition.clone(), 42);
        client.record_high_watermark(Partition::new("trades.dev", -1), 7);
        client.record_high_watermark(Partition::new("trades.dev", 4), -1001);

        assert_eq!(client.high_watermark(&partition), Some(42));
        assert_eq!(client.high_watermark(&Partition::new("trades.dev", -1)), None);
        assert_eq!(client.high_watermark(&Partition::new("trades.dev", 4)), None);

        // later reports replace earlier ones
        client.record_high_watermark(partition.clone(), 40);
        assert_eq!(client.high_watermark(&partition), Some(40));
    }

    #[test]
    fn test_child_tokens_follow_session() {
        let session = Session::new(1, client());
        let child = session.child_token();
        let sibling = session.child_token();

        sibling.cancel();
        assert!(!child.is_cancelled());
        assert!(!session.is_cancelled());

        session.cancel();
        assert!(child.is_cancelled());
    }
}
