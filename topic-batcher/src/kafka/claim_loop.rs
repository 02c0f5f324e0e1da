//! Claim Loop - one task per assigned partition
//!
//! Waits on cancellation, the status tick, the stall retry timer and its
//! record channel in a single `select!`. Handlers run inline, so a slow
//! handler only holds back its own partition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::BatchAccumulator;
use crate::config::ImmediateFailureMode;
use crate::handler::{BatchHandler, HandlerBinding, HandlerRegistry, ImmediateHandler};
use crate::kafka::flush::{flush, FlushOutcome, FlushTarget, FlushTrigger};
use crate::kafka::metrics_consts::{
    ACCUMULATED_RECORDS, BATCH_APPEND_STALLED, CLAIM_LOOPS_ACTIVE, IMMEDIATE_HANDLER_DURATION_MS,
    IMMEDIATE_HANDLER_RESULTS, OFFSET_COMMIT_ERRORS, OFFSET_MARK_ERRORS, PARTITION_LAG,
    RECORDS_WITHOUT_HANDLER,
};
use crate::kafka::record::Record;
use crate::kafka::session::Session;
use crate::kafka::types::Partition;
use crate::policy::BatchPolicy;
use crate::progress::ProgressTracker;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone)]
pub struct ClaimSettings {
    pub status_interval: Duration,
    pub stall_retry_interval: Duration,
    pub batch_retry: RetryPolicy,
    pub immediate_failure: ImmediateFailureMode,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(20),
            stall_retry_interval: Duration::from_secs(5),
            batch_retry: RetryPolicy::default(),
            immediate_failure: ImmediateFailureMode::default(),
        }
    }
}

/// Why a claim loop stopped reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimExit {
    Cancelled,
    ChannelClosed,
}

/// Everything a claim loop only reads.
struct ClaimScope {
    partition: Partition,
    worker_id: usize,
    registry: Arc<HandlerRegistry>,
    progress: Arc<ProgressTracker>,
    session: Arc<Session>,
    settings: ClaimSettings,
}

impl ClaimScope {
    fn flush_target(&self) -> FlushTarget<'_> {
        FlushTarget {
            worker_id: self.worker_id,
            client: self.session.client(),
            progress: &self.progress,
            retry: &self.settings.batch_retry,
        }
    }

    fn batch_handler(&self, topic: &str) -> Option<Arc<dyn BatchHandler>> {
        match self.registry.binding(topic) {
            Some(HandlerBinding::Batch { handler, .. }) => Some(handler.clone()),
            _ => None,
        }
    }

    /// Mark, commit and record progress for a single handled record
    fn acknowledge(&self, record: &Record) {
        self.mark_and_commit(record);
        self.progress
            .record(&record.topic_partition(), record.offset());
    }

    /// Moves the broker offset past `record` without counting it as processed
    fn mark_and_commit(&self, record: &Record) {
        let client = self.session.client();

        if let Err(e) = client.mark(record) {
            warn!(
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                "Failed to mark record as processed: {e}"
            );
            metrics::counter!(OFFSET_MARK_ERRORS, "topic" => record.topic().to_string())
                .increment(1);
        }

        if let Err(e) = client.commit() {
            warn!(
                topic = record.topic(),
                partition = record.partition(),
                "Failed to commit offsets: {e}"
            );
            metrics::counter!(OFFSET_COMMIT_ERRORS, "topic" => record.topic().to_string())
                .increment(1);
        }
    }
}

pub struct ClaimLoop {
    scope: ClaimScope,
    cancel: CancellationToken,
    accumulators: HashMap<String, BatchAccumulator>,
}

impl ClaimLoop {
    pub fn new(
        partition: Partition,
        worker_id: usize,
        registry: Arc<HandlerRegistry>,
        progress: Arc<ProgressTracker>,
        session: Arc<Session>,
        settings: ClaimSettings,
    ) -> Self {
        let cancel = session.child_token();
        Self {
            scope: ClaimScope {
                partition,
                worker_id,
                registry,
                progress,
                session,
                settings,
            },
            cancel,
            accumulators: HashMap::new(),
        }
    }

    /// Cancels this loop only; cancelling the session cancels every loop of it.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(mut self, mut records: mpsc::Receiver<Record>) -> ClaimExit {
        let partition = self.scope.partition.clone();
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            worker_id = self.scope.worker_id,
            generation = self.scope.session.generation(),
            "Claim loop started"
        );
        metrics::gauge!(CLAIM_LOOPS_ACTIVE).increment(1.0);

        let status_interval = self.scope.settings.status_interval;
        let mut status = interval_at(Instant::now() + status_interval, status_interval);
        status.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let stall_retry = sleep(self.scope.settings.stall_retry_interval);
        tokio::pin!(stall_retry);
        let mut stalled: Option<Record> = None;

        let cancel = self.cancel.clone();
        let exit = loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break ClaimExit::Cancelled,

                _ = status.tick() => self.on_status_tick().await,

                _ = &mut stall_retry, if stalled.is_some() => {
                    if let Some(record) = stalled.take() {
                        stalled = self.dispatch(record).await;
                    }
                    if stalled.is_some() {
                        stall_retry
                            .as_mut()
                            .reset(Instant::now() + self.scope.settings.stall_retry_interval);
                    }
                }

                next = records.recv(), if stalled.is_none() => match next {
                    Some(record) => {
                        stalled = self.dispatch(record).await;
                        if stalled.is_some() {
                            stall_retry
                                .as_mut()
                                .reset(Instant::now() + self.scope.settings.stall_retry_interval);
                        }
                    }
                    None => break ClaimExit::ChannelClosed,
                },
            }
        };

        if let Some(record) = stalled {
            warn!(
                topic = record.topic(),
                partition = record.partition(),
                offset = record.offset(),
                "Dropping held record on exit, it will be redelivered"
            );
        }

        self.drain().await;

        metrics::gauge!(CLAIM_LOOPS_ACTIVE).decrement(1.0);
        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            worker_id = self.scope.worker_id,
            exit = ?exit,
            "Claim loop stopped"
        );
        exit
    }

    /// Returns the record if it has to be held back.
    async fn dispatch(&mut self, record: Record) -> Option<Record> {
        match self.scope.registry.binding(record.topic()).cloned() {
            Some(HandlerBinding::Immediate(handler)) => {
                self.handle_immediate(record, handler).await;
                None
            }
            Some(HandlerBinding::Batch { handler, policy }) => {
                self.append_batch(record, handler, policy).await
            }
            None => {
                warn!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    "No handler registered for topic, record left unmarked"
                );
                metrics::counter!(RECORDS_WITHOUT_HANDLER, "topic" => record.topic().to_string())
                    .increment(1);
                None
            }
        }
    }

    async fn handle_immediate(&mut self, record: Record, handler: Arc<dyn ImmediateHandler>) {
        let mode = self.scope.settings.immediate_failure;
        let retry = &self.scope.settings.batch_retry;
        let started = Instant::now();
        let mut attempt: u32 = 0;

        let result = loop {
            attempt += 1;
            match handler.handle(record.value(), record.topic()).await {
                Ok(()) => break Ok(()),
                Err(e) if mode == ImmediateFailureMode::Retry && retry.should_retry(attempt) => {
                    let wait = retry.retry_interval(attempt);
                    warn!(
                        topic = record.topic(),
                        offset = record.offset(),
                        attempt = attempt,
                        "Immediate handler failed, retrying in {wait:?}: {e:#}"
                    );
                    sleep(wait).await;
                }
                Err(e) => break Err(e),
            }
        };

        metrics::histogram!(IMMEDIATE_HANDLER_DURATION_MS, "topic" => record.topic().to_string())
            .record(started.elapsed().as_millis() as f64);

        let outcome = match result {
            Ok(()) => {
                self.scope.acknowledge(&record);
                "success"
            }
            Err(e) => {
                error!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    attempts = attempt,
                    failure_mode = mode.as_str(),
                    "Immediate handler failed: {e:#}"
                );
                if mode == ImmediateFailureMode::Commit {
                    self.scope.mark_and_commit(&record);
                    "failed_committed"
                } else {
                    "failed"
                }
            }
        };

        metrics::counter!(
            IMMEDIATE_HANDLER_RESULTS,
            "topic" => record.topic().to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }

    async fn append_batch(
        &mut self,
        record: Record,
        handler: Arc<dyn BatchHandler>,
        policy: BatchPolicy,
    ) -> Option<Record> {
        let target = self.scope.flush_target();
        let accumulator = self
            .accumulators
            .entry(record.topic().to_string())
            .or_insert_with(|| BatchAccumulator::new(policy, Instant::now()));

        if accumulator.is_full() {
            if let Err(e) = flush(accumulator, handler.as_ref(), &target, FlushTrigger::Size).await
            {
                error!(
                    topic = record.topic(),
                    partition = record.partition(),
                    offset = record.offset(),
                    "Full batch could not be flushed, holding record: {e}"
                );
                metrics::counter!(BATCH_APPEND_STALLED, "topic" => record.topic().to_string())
                    .increment(1);
                return Some(record);
            }
        }

        if let Err(record) = accumulator.push(record) {
            return Some(record);
        }

        if accumulator.is_full() {
            // a failure leaves the batch full, the next append retries it
            if let Err(e) = flush(accumulator, handler.as_ref(), &target, FlushTrigger::Size).await
            {
                error!(
                    topic = self.scope.partition.topic(),
                    partition = self.scope.partition.partition_number(),
                    "Size flush failed: {e}"
                );
            }
        }

        None
    }

    async fn on_status_tick(&mut self) {
        let now = Instant::now();
        let target = self.scope.flush_target();

        for (topic, accumulator) in self.accumulators.iter_mut() {
            if accumulator.is_empty() || !accumulator.timed_out(now) {
                continue;
            }

            if !accumulator.meets_minimum() {
                debug!(
                    topic = topic,
                    len = accumulator.len(),
                    min = accumulator.policy().min_batch_size,
                    "Batch timed out below minimum, keep accumulating"
                );
                accumulator.reset_timer(now);
                continue;
            }

            let Some(handler) = self.scope.batch_handler(topic) else {
                continue;
            };

            match flush(accumulator, handler.as_ref(), &target, FlushTrigger::Timeout).await {
                Ok(FlushOutcome::TooSmall { .. }) => accumulator.reset_timer(now),
                Ok(_) => {}
                Err(e) => error!(topic = topic, "Timeout flush failed: {e}"),
            }
        }

        self.report_status();
    }

    /// Only place lag is computed
    fn report_status(&self) {
        let partition = &self.scope.partition;
        let high_watermark = self.scope.session.client().high_watermark(partition);
        let last_processed = self.scope.progress.last_processed(partition);
        let lag = high_watermark.and_then(|hwm| self.scope.progress.lag(partition, hwm));

        if let Some(lag) = lag {
            metrics::gauge!(
                PARTITION_LAG,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .set(lag as f64);
        }

        let mut buffered = 0;
        for (topic, accumulator) in &self.accumulators {
            buffered += accumulator.len();
            metrics::gauge!(
                ACCUMULATED_RECORDS,
                "topic" => topic.clone(),
                "partition" => partition.partition_number().to_string()
            )
            .set(accumulator.len() as f64);
        }

        info!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            worker_id = self.scope.worker_id,
            high_watermark = high_watermark,
            last_processed = last_processed,
            lag = lag,
            buffered = buffered,
            "Partition status"
        );
    }

    /// One flush attempt per non-empty accumulator, errors only logged.
    async fn drain(&mut self) {
        let target = self.scope.flush_target();

        for (topic, accumulator) in self.accumulators.iter_mut() {
            if accumulator.is_empty() {
                continue;
            }
            let Some(handler) = self.scope.batch_handler(topic) else {
                continue;
            };

            match flush(accumulator, handler.as_ref(), &target, FlushTrigger::Drain).await {
                Ok(outcome) => debug!(topic = topic, outcome = ?outcome, "Drained batch"),
                Err(e) => error!(
                    topic = topic,
                    partition = self.scope.partition.partition_number(),
                    dropped = accumulator.len(),
                    "Drain flush failed, records left for redelivery: {e}"
                ),
            }
        }

        self.accumulators.clear();
    }
}
