use tokio::time::Instant;

use crate::kafka::record::Record;
use crate::policy::BatchPolicy;

/// Pending records of one batch topic inside one claim loop, plus the
/// deadline after which a timeout flush is considered.
///
/// Never holds more than `max_batch_size` records: `push` hands the record
/// back instead of growing past the limit.
#[derive(Debug)]
pub struct BatchAccumulator {
    records: Vec<Record>,
    policy: BatchPolicy,
    deadline: Instant,
}

impl BatchAccumulator {
    pub fn new(policy: BatchPolicy, now: Instant) -> Self {
        Self {
            records: Vec::with_capacity(policy.max_batch_size),
            policy,
            deadline: now + policy.batch_timeout,
        }
    }

    pub fn push(&mut self, record: Record) -> Result<(), Record> {
        if self.is_full() {
            return Err(record);
        }
        self.records.push(record);
        Ok(())
    }

    pub fn is_full(&self) -> bool {
        self.records.len() >= self.policy.max_batch_size
    }

    pub fn meets_minimum(&self) -> bool {
        self.records.len() >= self.policy.min_batch_size
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn reset_timer(&mut self, now: Instant) {
        self.deadline = now + self.policy.batch_timeout;
    }

    /// Empties the buffer after a successful flush; the allocation is kept.
    pub fn clear(&mut self, now: Instant) {
        self.records.clear();
        self.reset_timer(now);
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(Record::offset)
    }

    pub fn last_offset(&self) -> Option<i64> {
        self.records.last().map(Record::offset)
    }
}
