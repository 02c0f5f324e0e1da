// ==== Routing metrics ====
/// Counter for records pulled off the consumer stream
pub const RECORDS_RECEIVED: &str = "topic_batcher_records_received_total";

/// Counter for records dropped by the router because no session was live
pub const RECORDS_UNROUTED: &str = "topic_batcher_records_unrouted_total";

/// Counter for records whose topic has no registered handler
pub const RECORDS_WITHOUT_HANDLER: &str = "topic_batcher_records_without_handler_total";

/// Counter for partitions paused because their claim loop channel was full
pub const PARTITION_PAUSED: &str = "topic_batcher_partition_paused_total";

/// Gauge for records waiting in a paused partition's overflow queue
pub const PARTITION_OVERFLOW_DEPTH: &str = "topic_batcher_partition_overflow_depth";

// ==== Claim loop metrics ====
/// Gauge for running claim loops
pub const CLAIM_LOOPS_ACTIVE: &str = "topic_batcher_claim_loops_active";

/// Counter for immediate handler invocations, labelled by outcome
pub const IMMEDIATE_HANDLER_RESULTS: &str = "topic_batcher_immediate_handler_total";

/// Histogram for immediate handler latency
pub const IMMEDIATE_HANDLER_DURATION_MS: &str = "topic_batcher_immediate_handler_duration_ms";

/// Counter for records held back because the full batch could not be flushed
pub const BATCH_APPEND_STALLED: &str = "topic_batcher_batch_append_stalled_total";

/// Gauge for records buffered per topic-partition at the last status tick
pub const ACCUMULATED_RECORDS: &str = "topic_batcher_accumulated_records";

/// Gauge for high watermark minus last processed offset
pub const PARTITION_LAG: &str = "topic_batcher_partition_lag";

// ==== Flush metrics ====
/// Counter for flushes, labelled by trigger and outcome
pub const BATCH_FLUSH_RESULTS: &str = "topic_batcher_batch_flush_total";

/// Histogram for the number of records in executed flushes
pub const BATCH_FLUSH_SIZE: &str = "topic_batcher_batch_flush_size";

/// Histogram for handler attempts needed per flush
pub const BATCH_FLUSH_ATTEMPTS: &str = "topic_batcher_batch_flush_attempts";

/// Histogram for the wall time of a flush, backoff included
pub const BATCH_FLUSH_DURATION_MS: &str = "topic_batcher_batch_flush_duration_ms";

// ==== Offset metrics ====
/// Counter for failed client-side offset stores
pub const OFFSET_MARK_ERRORS: &str = "topic_batcher_offset_mark_errors_total";

/// Counter for failed offset commits
pub const OFFSET_COMMIT_ERRORS: &str = "topic_batcher_offset_commit_errors_total";

/// Counter for progress updates rejected because they would move backwards
pub const PROGRESS_OUT_OF_ORDER: &str = "topic_batcher_progress_out_of_order_total";

// ==== Group metrics ====
/// Counter for broker errors, labelled by level and error class
pub const BROKER_ERRORS: &str = "topic_batcher_broker_errors_total";

/// Counter for restarts of the join loop
pub const JOIN_RETRIES: &str = "topic_batcher_join_retries_total";

/// Counter for rebalance callbacks, labelled by event type
pub const REBALANCE_EVENTS: &str = "topic_batcher_rebalance_events_total";

/// Counter for rebalance callbacks skipped because they carried no partitions
pub const REBALANCE_EMPTY_SKIPPED: &str = "topic_batcher_rebalance_empty_skipped_total";

/// Gauge for the generation of the live session
pub const SESSION_GENERATION: &str = "topic_batcher_session_generation";

// ==== Relay metrics ====
/// Counter for records seen by the relay handler, labelled by outcome
pub const RELAY_RECORDS: &str = "topic_batcher_relay_records_total";
