use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::handler::HandlerRegistry;
use crate::kafka::claim_loop::{ClaimExit, ClaimLoop, ClaimSettings};
use crate::kafka::metrics_consts::{PARTITION_OVERFLOW_DEPTH, PARTITION_PAUSED, RECORDS_UNROUTED};
use crate::kafka::record::Record;
use crate::kafka::session::{GroupClient, Session, SessionSlot};
use crate::kafka::types::Partition;
use crate::progress::ProgressTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the partition's claim loop
    Routed,
    /// Queued behind a full channel; the partition is paused
    Overflowed,
    /// Not assigned, or no live session to claim the partition with
    Dropped,
}

fn unrouted(record: &Record, reason: &'static str) -> RouteOutcome {
    metrics::counter!(
        RECORDS_UNROUTED,
        "topic" => record.topic().to_string(),
        "reason" => reason
    )
    .increment(1);
    RouteOutcome::Dropped
}

struct ClaimHandle {
    sender: mpsc::Sender<Record>,
    overflow: VecDeque<Record>,
    paused: bool,
    generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<ClaimExit>,
}

impl ClaimHandle {
    /// Still reading, and its session has not ended
    fn is_live(&self) -> bool {
        !self.sender.is_closed() && !self.cancel.is_cancelled()
    }
}

/// Owns the claim loops of the current assignment, one per partition.
///
/// The consumer task calls `route` for every delivered record; each partition
/// has a bounded channel to its claim loop. When a channel is full, records
/// queue up in that partition's overflow (keeping order) and the partition
/// is paused at the broker until `pump_overflow` has drained the queue.
pub struct PartitionRouter {
    registry: Arc<HandlerRegistry>,
    progress: Arc<ProgressTracker>,
    sessions: Arc<SessionSlot>,
    client: Arc<dyn GroupClient>,
    settings: ClaimSettings,
    channel_capacity: usize,
    runtime: Handle,
    claims: Mutex<HashMap<Partition, ClaimHandle>>,
    next_worker_id: AtomicUsize,
}

impl PartitionRouter {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        progress: Arc<ProgressTracker>,
        sessions: Arc<SessionSlot>,
        client: Arc<dyn GroupClient>,
        settings: ClaimSettings,
        channel_capacity: usize,
        runtime: Handle,
    ) -> Self {
        Self {
            registry,
            progress,
            sessions,
            client,
            settings,
            channel_capacity: channel_capacity.max(1),
            runtime,
            claims: Mutex::new(HashMap::new()),
            next_worker_id: AtomicUsize::new(0),
        }
    }

    fn spawn_claim(&self, partition: &Partition, session: &Arc<Session>) -> ClaimHandle {
        let (sender, receiver) = mpsc::channel(self.channel_capacity);
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);

        let claim = ClaimLoop::new(
            partition.clone(),
            worker_id,
            self.registry.clone(),
            self.progress.clone(),
            session.clone(),
            self.settings.clone(),
        );
        let cancel = claim.cancellation();
        let task = self.runtime.spawn(claim.run(receiver));

        ClaimHandle {
            sender,
            overflow: VecDeque::new(),
            paused: false,
            generation: session.generation(),
            cancel,
            task,
        }
    }

    /// Starts claim loops for newly assigned partitions. Partitions already
    /// claimed under the same session keep their loop.
    pub fn assign(&self, session: &Arc<Session>, partitions: &[Partition]) {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);

        for partition in partitions {
            if let Some(existing) = claims.get(partition) {
                if existing.generation == session.generation() && existing.is_live() {
                    continue;
                }
                if let Some(stale) = claims.remove(partition) {
                    stale.cancel.cancel();
                }
            }

            let handle = self.spawn_claim(partition, session);
            claims.insert(partition.clone(), handle);
        }

        info!(
            generation = session.generation(),
            assigned = partitions.len(),
            claimed = claims.len(),
            "Partitions assigned to claim loops"
        );
    }

    /// Hands `record` to its partition's claim loop. Only partitions passed
    /// to `assign` are routed; a claimed partition whose loop has stopped is
    /// restarted under the live session, keeping its queued records.
    pub fn route(&self, record: Record) -> RouteOutcome {
        let partition = record.topic_partition();
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);

        let handle = match claims.get_mut(&partition) {
            None => {
                debug!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    "Record for a partition not assigned to us, dropping"
                );
                return unrouted(&record, "unassigned");
            }
            Some(handle) if handle.is_live() => handle,
            Some(handle) => {
                let Some(session) = self.sessions.current().filter(|s| !s.is_cancelled()) else {
                    warn!(
                        topic = record.topic(),
                        partition = record.partition(),
                        offset = record.offset(),
                        "No live session, record left for redelivery"
                    );
                    return unrouted(&record, "no_session");
                };

                debug!(partition = %partition, "Restarting stopped claim loop");
                let mut restarted = self.spawn_claim(&partition, &session);
                restarted.overflow = std::mem::take(&mut handle.overflow);
                restarted.paused = handle.paused;
                *handle = restarted;
                handle
            }
        };

        // keep order: once anything is queued, everything queues behind it
        if !handle.overflow.is_empty() {
            handle.overflow.push_back(record);
            return RouteOutcome::Overflowed;
        }

        match handle.sender.try_send(record) {
            Ok(()) => RouteOutcome::Routed,
            Err(TrySendError::Full(record)) => {
                handle.overflow.push_back(record);
                if !handle.paused {
                    match self.client.pause(&partition) {
                        Ok(()) => debug!(partition = %partition, "Paused partition, claim loop is behind"),
                        Err(e) => warn!(partition = %partition, "Failed to pause partition: {e}"),
                    }
                    handle.paused = true;
                    metrics::counter!(PARTITION_PAUSED, "topic" => partition.topic().to_string())
                        .increment(1);
                }
                RouteOutcome::Overflowed
            }
            Err(TrySendError::Closed(record)) => {
                warn!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    "Claim loop stopped, record left for redelivery"
                );
                unrouted(&record, "stopped")
            }
        }
    }

    /// Moves queued records into their channels in order and resumes
    /// partitions whose queue is empty again.
    pub fn pump_overflow(&self) {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);

        for (partition, handle) in claims.iter_mut() {
            if !handle.paused && handle.overflow.is_empty() {
                continue;
            }

            while let Some(record) = handle.overflow.pop_front() {
                match handle.sender.try_send(record) {
                    Ok(()) => {}
                    Err(TrySendError::Full(record)) => {
                        handle.overflow.push_front(record);
                        break;
                    }
                    Err(TrySendError::Closed(_)) => {
                        warn!(
                            partition = %partition,
                            dropped = handle.overflow.len() + 1,
                            "Claim loop stopped, overflow left for redelivery"
                        );
                        handle.overflow.clear();
                        break;
                    }
                }
            }

            metrics::gauge!(
                PARTITION_OVERFLOW_DEPTH,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .set(handle.overflow.len() as f64);

            if handle.paused && handle.overflow.is_empty() {
                match self.client.resume(partition) {
                    Ok(()) => debug!(partition = %partition, "Resumed partition"),
                    Err(e) => warn!(partition = %partition, "Failed to resume partition: {e}"),
                }
                handle.paused = false;
            }
        }
    }

    /// Cancels the claim loops of revoked partitions. The returned tasks
    /// finish once each loop has drained its batches.
    pub fn revoke(&self, partitions: &[Partition]) -> Vec<JoinHandle<ClaimExit>> {
        let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);

        partitions
            .iter()
            .filter_map(|partition| claims.remove(partition).map(|h| (partition, h)))
            .map(|(partition, handle)| {
                if !handle.overflow.is_empty() {
                    info!(
                        partition = %partition,
                        dropped = handle.overflow.len(),
                        "Revoked partition had queued records, left for redelivery"
                    );
                }
                handle.cancel.cancel();
                handle.task
            })
            .collect()
    }

    /// Cancels every claim loop and waits up to `timeout` for them to drain.
    pub async fn shutdown(&self, timeout: Duration) {
        let tasks: Vec<JoinHandle<ClaimExit>> = {
            let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
            claims
                .drain()
                .map(|(_, handle)| {
                    handle.cancel.cancel();
                    handle.task
                })
                .collect()
        };

        if tasks.is_empty() {
            return;
        }

        let count = tasks.len();
        match tokio::time::timeout(timeout, join_all(tasks)).await {
            Ok(results) => {
                let failed = results.iter().filter(|r| r.is_err()).count();
                info!(count = count, failed = failed, "Claim loops drained");
            }
            Err(_) => warn!(
                count = count,
                "Claim loops did not drain within {timeout:?}"
            ),
        }
    }

    pub fn claimed_partitions(&self) -> Vec<Partition> {
        let claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
        let mut partitions: Vec<Partition> = claims.keys().cloned().collect();
        partitions.sort();
        partitions
    }

    pub fn overflow_len(&self, partition: &Partition) -> usize {
        self.claims
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .map_or(0, |handle| handle.overflow.len())
    }
}
