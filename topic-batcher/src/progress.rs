//! Progress Tracker - last successfully processed offset per partition
//!
//! Independent of the offsets committed to the broker: entries only move
//! after a handler succeeded, and only forwards. Claim loops write their own
//! partition's entry; status reporting reads all of them.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use tracing::{debug, warn};

use crate::kafka::metrics_consts::PROGRESS_OUT_OF_ORDER;
use crate::kafka::types::Partition;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEntry {
    pub topic: String,
    pub partition: i32,
    pub last_processed_offset: i64,
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    offsets: RwLock<HashMap<Partition, i64>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `offset` as processed. Offsets older than the current entry are ignored.
    pub fn record(&self, partition: &Partition, offset: i64) {
        let mut offsets = self
            .offsets
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match offsets.get_mut(partition) {
            Some(current) if offset < *current => {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    current = *current,
                    offset = offset,
                    "Ignoring processed offset behind recorded progress"
                );
                metrics::counter!(
                    PROGRESS_OUT_OF_ORDER,
                    "topic" => partition.topic().to_string(),
                    "partition" => partition.partition_number().to_string()
                )
                .increment(1);
            }
            Some(current) => *current = offset,
            None => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = offset,
                    "Initializing partition progress"
                );
                offsets.insert(partition.clone(), offset);
            }
        }
    }

    pub fn last_processed(&self, partition: &Partition) -> Option<i64> {
        self.offsets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(partition)
            .copied()
    }

    /// `high_watermark - last processed offset`, or `None` before the first success.
    pub fn lag(&self, partition: &Partition, high_watermark: i64) -> Option<i64> {
        self.last_processed(partition)
            .map(|last| (high_watermark - last).max(0))
    }

    /// Point-in-time copy, sorted by topic then partition
    pub fn snapshot(&self) -> Vec<ProgressEntry> {
        let offsets = self.offsets.read().unwrap_or_else(PoisonError::into_inner);

        let mut entries: Vec<ProgressEntry> = offsets
            .iter()
            .map(|(partition, offset)| ProgressEntry {
                topic: partition.topic().to_string(),
                partition: partition.partition_number(),
                last_processed_offset: *offset,
            })
            .collect();
        entries.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        entries
    }

    pub fn len(&self) -> usize {
        self.offsets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
