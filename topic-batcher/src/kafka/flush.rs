//! Flush - runs one accumulated batch through its handler
//!
//! Handler retries happen here; the claim loop only sees the final outcome.
//! A failed flush leaves the accumulator untouched so the same records are
//! replayed, in the same order, on the next attempt or after redelivery.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::accumulator::BatchAccumulator;
use crate::error::FlushError;
use crate::handler::BatchHandler;
use crate::kafka::metrics_consts::{
    BATCH_FLUSH_ATTEMPTS, BATCH_FLUSH_DURATION_MS, BATCH_FLUSH_RESULTS, BATCH_FLUSH_SIZE,
    OFFSET_COMMIT_ERRORS, OFFSET_MARK_ERRORS,
};
use crate::kafka::session::GroupClient;
use crate::kafka::types::Partition;
use crate::progress::ProgressTracker;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The accumulator reached its maximum size
    Size,
    /// The status tick found the batch deadline elapsed
    Timeout,
    /// The claim loop is exiting; single best-effort attempt
    Drain,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timeout => "timeout",
            FlushTrigger::Drain => "drain",
        }
    }

    fn enforces_minimum(&self) -> bool {
        matches!(self, FlushTrigger::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Handler succeeded; this many records were marked and cleared
    Flushed(usize),
    /// Timeout flush skipped, batch left as it was
    TooSmall { len: usize, min: usize },
    Empty,
}

/// Where a flush reports to once the handler has succeeded.
pub struct FlushTarget<'a> {
    pub worker_id: usize,
    pub client: &'a dyn GroupClient,
    pub progress: &'a ProgressTracker,
    pub retry: &'a RetryPolicy,
}

pub async fn flush(
    accumulator: &mut BatchAccumulator,
    handler: &dyn BatchHandler,
    target: &FlushTarget<'_>,
    trigger: FlushTrigger,
) -> Result<FlushOutcome, FlushError> {
    let Some(first) = accumulator.records().first() else {
        return Ok(FlushOutcome::Empty);
    };
    let batch_partition: Partition = first.topic_partition();
    let topic = batch_partition.topic();
    let partition = batch_partition.partition_number();

    let len = accumulator.len();
    let min = accumulator.policy().min_batch_size;

    if trigger.enforces_minimum() && len < min {
        debug!(
            topic = topic,
            partition = partition,
            len = len,
            min = min,
            "Batch below minimum size, not flushing on timeout"
        );
        metrics::counter!(
            BATCH_FLUSH_RESULTS,
            "trigger" => trigger.as_str(),
            "outcome" => "too_small"
        )
        .increment(1);
        return Ok(FlushOutcome::TooSmall { len, min });
    }

    let started = Instant::now();
    let mut attempt: u32 = 0;

    loop {
        attempt += 1;

        let result = handler
            .handle(topic, accumulator.records(), partition, target.worker_id)
            .await;

        let Err(error) = result else {
            break;
        };

        let may_retry = trigger != FlushTrigger::Drain && target.retry.should_retry(attempt);
        if !may_retry {
            metrics::counter!(
                BATCH_FLUSH_RESULTS,
                "trigger" => trigger.as_str(),
                "outcome" => "failed"
            )
            .increment(1);
            metrics::histogram!(BATCH_FLUSH_ATTEMPTS).record(attempt as f64);

            return Err(FlushError::Exhausted {
                topic: topic.to_string(),
                attempts: attempt,
                source: error,
            });
        }

        let wait: Duration = target.retry.retry_interval(attempt);
        warn!(
            topic = topic,
            partition = partition,
            attempt = attempt,
            len = len,
            retry_in_ms = wait.as_millis() as u64,
            "Batch handler failed: {error:#}"
        );
        sleep(wait).await;
    }

    for record in accumulator.records() {
        if let Err(e) = target.client.mark(record) {
            warn!(
                topic = topic,
                partition = partition,
                offset = record.offset(),
                "Failed to mark record as processed: {e}"
            );
            metrics::counter!(OFFSET_MARK_ERRORS, "topic" => topic.to_string()).increment(1);
        }
    }

    if let Some(last_offset) = accumulator.last_offset() {
        target.progress.record(&batch_partition, last_offset);
    }

    if let Err(e) = target.client.commit() {
        warn!(
            topic = topic,
            partition = partition,
            "Failed to commit offsets after flush: {e}"
        );
        metrics::counter!(OFFSET_COMMIT_ERRORS, "topic" => topic.to_string()).increment(1);
    }

    let elapsed = started.elapsed();
    info!(
        topic = topic,
        partition = partition,
        worker_id = target.worker_id,
        trigger = trigger.as_str(),
        len = len,
        first_offset = accumulator.first_offset(),
        last_offset = accumulator.last_offset(),
        attempts = attempt,
        elapsed_ms = elapsed.as_millis() as u64,
        "Flushed batch"
    );
    metrics::counter!(
        BATCH_FLUSH_RESULTS,
        "trigger" => trigger.as_str(),
        "outcome" => "success"
    )
    .increment(1);
    metrics::histogram!(BATCH_FLUSH_SIZE).record(len as f64);
    metrics::histogram!(BATCH_FLUSH_ATTEMPTS).record(attempt as f64);
    metrics::histogram!(BATCH_FLUSH_DURATION_MS).record(elapsed.as_millis() as f64);

    accumulator.clear(Instant::now());

    Ok(FlushOutcome::Flushed(len))
}
