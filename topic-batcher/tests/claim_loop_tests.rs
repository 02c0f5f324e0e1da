use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tokio::time::sleep;

use topic_batcher::config::ImmediateFailureMode;
use topic_batcher::kafka::metrics_consts::PARTITION_LAG;
use topic_batcher::kafka::{ClaimExit, ClaimLoop, ClaimSettings, Partition, Record, Session};
use topic_batcher::retry::RetryPolicy;
use topic_batcher::test_utils::{
    record_at, InMemoryGroupClient, RecordingBatchHandler, RecordingImmediateHandler,
};
use topic_batcher::{BatchPolicy, HandlerRegistry, ProgressTracker};

const TRADES: &str = "trades.dev";
const POOLS: &str = "pools.dev";
const ENTITIES: &str = "entities.dev";

struct Harness {
    client: Arc<InMemoryGroupClient>,
    progress: Arc<ProgressTracker>,
    session: Arc<Session>,
    sender: mpsc::Sender<Record>,
    task: JoinHandle<ClaimExit>,
}

impl Harness {
    fn start(registry: HandlerRegistry, settings: ClaimSettings, partition: Partition) -> Self {
        let client = Arc::new(InMemoryGroupClient::default());
        let progress = Arc::new(ProgressTracker::new());
        let session = Arc::new(Session::new(1, client.clone()));
        let (sender, receiver) = mpsc::channel(16);

        let claim = ClaimLoop::new(
            partition,
            0,
            Arc::new(registry),
            progress.clone(),
            session.clone(),
            settings,
        );
        let task = tokio::spawn(claim.run(receiver));

        Self {
            client,
            progress,
            session,
            sender,
            task,
        }
    }

    async fn send(&self, record: Record) {
        self.sender.send(record).await.unwrap();
    }

    async fn stop(self) -> ClaimExit {
        self.session.cancel();
        self.task.await.unwrap()
    }
}

fn settings() -> ClaimSettings {
    ClaimSettings {
        status_interval: Duration::from_secs(1),
        stall_retry_interval: Duration::from_secs(5),
        batch_retry: RetryPolicy::default(),
        immediate_failure: ImmediateFailureMode::Skip,
    }
}

fn batch_registry(topic: &str, handler: Arc<RecordingBatchHandler>, policy: BatchPolicy) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new(policy);
    registry.register_batch(topic, handler, None, None, None);
    registry
}

fn small_policy() -> BatchPolicy {
    BatchPolicy::new(3, 2, Duration::from_secs(5))
}

#[tokio::test(start_paused = true)]
async fn test_full_batch_is_flushed_once() {
    let handler = Arc::new(RecordingBatchHandler::default());
    let harness = Harness::start(
        batch_registry(TRADES, handler.clone(), small_policy()),
        settings(),
        Partition::new(TRADES, 0),
    );

    for offset in 0..3 {
        harness.send(record_at(TRADES, 0, offset)).await;
    }
    sleep(Duration::from_millis(10)).await;

    let calls = handler.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].offsets, vec![0, 1, 2]);
    assert_eq!(calls[0].topic, TRADES);
    assert_eq!(calls[0].partition, 0);
    assert_eq!(harness.client.marked_offsets(TRADES, 0), vec![0, 1, 2]);
    assert_eq!(
        harness.progress.last_processed(&Partition::new(TRADES, 0)),
        Some(2)
    );

    assert_eq!(harness.stop().await, ClaimExit::Cancelled);
    assert_eq!(handler.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_below_minimum_keeps_accumulating() {
    let handler = Arc::new(RecordingBatchHandler::default());
    let harness = Harness::start(
        batch_registry(TRADES, handler.clone(), small_policy()),
        settings(),
        Partition::new(TRADES, 0),
    );

    harness.send(record_at(TRADES, 0, 0)).await;
    sleep(Duration::from_secs(6)).await;

    assert!(handler.calls().is_empty());
    assert!(harness.client.marked_offsets(TRADES, 0).is_empty());

    // still buffered: the drain picks it up regardless of the minimum
    let client = harness.client.clone();
    harness.stop().await;
    assert_eq!(handler.handled_offsets(), vec![0]);
    assert_eq!(client.marked_offsets(TRADES, 0), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_timeout_flush_at_minimum() {
    let handler = Arc::new(RecordingBatchHandler::default());
    let harness = Harness::start(
        batch_registry(TRADES, handler.clone(), small_policy()),
        settings(),
        Partition::new(TRADES, 0),
    );

    harness.send(record_at(TRADES, 0, 0)).await;
    harness.send(record_at(TRADES, 0, 1)).await;
    sleep(Duration::from_secs(4)).await;
    assert!(handler.calls().is_empty());

    sleep(Duration::from_secs(2)).await;
    assert_eq!(handler.handled_offsets(), vec![0, 1]);
    assert_eq!(harness.client.marked_offsets(TRADES, 0), vec![0, 1]);

    harness.stop().await;
    assert_eq!(handler.calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_partial_batch() {
    let handler = Arc::new(RecordingBatchHandler::default());
    let harness = Harness::start(
        batch_registry(TRADES, handler.clone(), small_policy()),
        settings(),
        Partition::new(TRADES, 0),
    );

    harness.send(record_at(TRADES, 0, 0)).await;
    sleep(Duration::from_secs(1)).await;
    harness.send(record_at(TRADES, 0, 1)).await;
    sleep(Duration::from_millis(10)).await;
    assert!(handler.calls().is_empty());

    let client = harness.client.clone();
    let progress = harness.progress.clone();
    assert_eq!(harness.stop().await, ClaimExit::Cancelled);

    let calls = handler.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].offsets, vec![0, 1]);
    assert_eq!(client.marked_offsets(TRADES, 0), vec![0, 1]);
    assert_eq!(progress.last_processed(&Partition::new(TRADES, 0)), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_batch_retries_with_linear_backoff() {
    let handler = Arc::new(RecordingBatchHandler::failing_times(2));
    let harness = Harness::start(
        batch_registry(TRADES, handler.clone(), small_policy()),
        settings(),
        Partition::new(TRADES, 0),
    );

    for offset in 10..13 {
        harness.send(record_at(TRADES, 0, offset)).await;
    }
    sleep(Duration::from_secs(5)).await;

    let calls = handler.calls();
    assert_eq!(calls.len(), 3);
    assert!(!calls[0].succeeded);
    assert!(!calls[1].succeeded);
    assert!(calls[2].succeeded);
    assert!(calls[2].at - calls[0].at >= Duration::from_secs(3));

    assert_eq!(harness.client.marked_offsets(TRADES, 0), vec![10, 11, 12]);
    assert_eq!(
        harness.progress.last_processed(&Partition::new(TRADES, 0)),
        Some(12)
    );

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_immediate_record_is_not_marked() {
    let handler = Arc::new(RecordingImmediateHandler::default().fail_on("0"));
    let mut registry = HandlerRegistry::new(BatchPolicy::default());
    registry.register_immediate(ENTITIES, handler.clone());
    let harness = Harness::start(registry, settings(), Partition::new(ENTITIES, 3));

    harness.send(record_at(ENTITIES, 3, 0)).await;
    harness.send(record_at(ENTITIES, 3, 1)).await;
    sleep(Duration::from_millis(10)).await;

    assert_eq!(handler.calls().len(), 2);
    assert_eq!(harness.client.marked_offsets(ENTITIES, 3), vec![1]);
    assert_eq!(
        harness.progress.last_processed(&Partition::new(ENTITIES, 3)),
        Some(1)
    );

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_immediate_retry_mode() {
    let handler = Arc::new(RecordingImmediateHandler::failing_times(2));
    let mut registry = HandlerRegistry::new(BatchPolicy::default());
    registry.register_immediate(ENTITIES, handler.clone());
    let harness = Harness::start(
        registry,
        ClaimSettings {
            immediate_failure: ImmediateFailureMode::Retry,
            ..settings()
        },
        Partition::new(ENTITIES, 0),
    );

    harness.send(record_at(ENTITIES, 0, 5)).await;
    sleep(Duration::from_secs(4)).await;

    assert_eq!(handler.calls().len(), 3);
    assert_eq!(harness.client.marked_offsets(ENTITIES, 0), vec![5]);

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_immediate_commit_mode_marks_failures() {
    let handler = Arc::new(RecordingImmediateHandler::default().fail_on("0"));
    let mut registry = HandlerRegistry::new(BatchPolicy::default());
    registry.register_immediate(ENTITIES, handler.clone());
    let harness = Harness::start(
        registry,
        ClaimSettings {
            immediate_failure: ImmediateFailureMode::Commit,
            ..settings()
        },
        Partition::new(ENTITIES, 0),
    );

    harness.send(record_at(ENTITIES, 0, 0)).await;
    sleep(Duration::from_millis(10)).await;

    assert_eq!(handler.calls().len(), 1);
    assert_eq!(harness.client.marked_offsets(ENTITIES, 0), vec![0]);
    assert_eq!(harness.client.commit_count(), 1);
    // committed, but never processed
    assert_eq!(
        harness.progress.last_processed(&Partition::new(ENTITIES, 0)),
        None
    );

    harness.send(record_at(ENTITIES, 0, 1)).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(harness.client.marked_offsets(ENTITIES, 0), vec![0, 1]);
    assert_eq!(
        harness.progress.last_processed(&Partition::new(ENTITIES, 0)),
        Some(1)
    );

    harness.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_record_without_handler_is_skipped() {
    let handler = Arc::new(RecordingBatchHandler::default());
    let harness = Harness::start(
        batch_registry(TRADES, handler.clone(), small_policy()),
        settings(),
        Partition::new("unknown.dev", 0),
    );

    harness.send(record_at("unknown.dev", 0, 0)).await;
    sleep(Duration::from_millis(10)).await;

    assert!(harness.client.marked_offsets("unknown.dev", 0).is_empty());
    assert!(harness.progress.is_empty());

    harness.stop().await;
    assert!(handler.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_full_batch_holds_back_records() {
    let handler = Arc::new(RecordingBatchHandler::always_failing());
    let harness = Harness::start(
        batch_registry(
            TRADES,
            handler.clone(),
            BatchPolicy::new(3, 2, Duration::from_secs(60)),
        ),
        ClaimSettings {
            status_interval: Duration::from_secs(60),
            ..settings()
        },
        Partition::new(TRADES, 0),
    );

    for offset in 0..5 {
        harness.send(record_at(TRADES, 0, offset)).await;
    }

    // eager flush fails (3 attempts), then the pre-append flush for offset 3 fails too
    sleep(Duration::from_secs(8)).await;
    let calls = handler.calls();
    assert_eq!(calls.len(), 6);
    assert!(calls.iter().all(|c| !c.succeeded && c.offsets == vec![0, 1, 2]));
    assert!(harness.client.marked_offsets(TRADES, 0).is_empty());
    assert_eq!(harness.progress.last_processed(&Partition::new(TRADES, 0)), None);

    // the held record is retried once the handler recovers
    handler.recover();
    sleep(Duration::from_secs(10)).await;
    assert_eq!(handler.handled_offsets(), vec![0, 1, 2]);

    let client = harness.client.clone();
    harness.stop().await;

    assert!(handler.calls().iter().all(|c| c.offsets.len() <= 3));
    assert_eq!(handler.handled_offsets(), vec![0, 1, 2, 3, 4]);
    assert_eq!(client.marked_offsets(TRADES, 0), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn test_drain_flushes_every_topic_once() {
    let handler = Arc::new(RecordingBatchHandler::default());
    let mut registry = HandlerRegistry::new(BatchPolicy::new(10, 5, Duration::from_secs(60)));
    registry.register_batch(TRADES, handler.clone(), None, None, None);
    registry.register_batch(POOLS, handler.clone(), None, None, None);
    let harness = Harness::start(registry, settings(), Partition::new(TRADES, 0));

    harness.send(record_at(TRADES, 0, 0)).await;
    harness.send(record_at(TRADES, 0, 1)).await;
    harness.send(record_at(POOLS, 0, 7)).await;
    sleep(Duration::from_millis(10)).await;
    assert!(handler.calls().is_empty());

    let progress = harness.progress.clone();
    harness.stop().await;

    let mut calls: Vec<(String, Vec<i64>)> = handler
        .calls()
        .into_iter()
        .map(|c| (c.topic, c.offsets))
        .collect();
    calls.sort();
    assert_eq!(
        calls,
        vec![
            (POOLS.to_string(), vec![7]),
            (TRADES.to_string(), vec![0, 1]),
        ]
    );
    assert_eq!(progress.last_processed(&Partition::new(POOLS, 0)), Some(7));
    assert_eq!(progress.last_processed(&Partition::new(TRADES, 0)), Some(1));
}

#[tokio::test(start_paused = true)]
async fn test_failed_drain_is_not_retried() {
    let handler = Arc::new(RecordingBatchHandler::always_failing());
    let harness = Harness::start(
        batch_registry(TRADES, handler.clone(), small_policy()),
        settings(),
        Partition::new(TRADES, 0),
    );

    harness.send(record_at(TRADES, 0, 0)).await;
    sleep(Duration::from_millis(10)).await;

    let client = harness.client.clone();
    harness.stop().await;

    assert_eq!(handler.calls().len(), 1);
    assert!(client.marked_offsets(TRADES, 0).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_closed_channel_drains_and_exits() {
    let handler = Arc::new(RecordingBatchHandler::default());
    let harness = Harness::start(
        batch_registry(TRADES, handler.clone(), small_policy()),
        settings(),
        Partition::new(TRADES, 0),
    );

    harness.send(record_at(TRADES, 0, 0)).await;
    let Harness { sender, task, .. } = harness;
    drop(sender);

    assert_eq!(task.await.unwrap(), ClaimExit::ChannelClosed);
    assert_eq!(handler.handled_offsets(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_status_tick_reports_without_flushing_fresh_batches() {
    let handler = Arc::new(RecordingBatchHandler::default());
    let harness = Harness::start(
        batch_registry(TRADES, handler.clone(), small_policy()),
        settings(),
        Partition::new(TRADES, 0),
    );

    harness.send(record_at(TRADES, 0, 0)).await;
    harness.send(record_at(TRADES, 0, 1)).await;
    sleep(Duration::from_secs(3)).await;

    // ticks ran, but the deadline has not passed yet
    assert!(handler.calls().is_empty());

    harness.stop().await;
}

fn snapshotter() -> &'static Snapshotter {
    // the recorder is global, installed once per test process
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        drop(recorder.install());
        snapshotter
    })
}

fn lag_gauge(topic: &str, partition: i32) -> Option<f64> {
    let partition = partition.to_string();
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .find(|(key, _, _, _)| {
            let key = key.key();
            key.name() == PARTITION_LAG
                && key.labels().any(|l| l.key() == "topic" && l.value() == topic)
                && key
                    .labels()
                    .any(|l| l.key() == "partition" && l.value() == partition)
        })
        .and_then(|(_, _, _, value)| match value {
            DebugValue::Gauge(v) => Some(v.into_inner()),
            _ => None,
        })
}

#[tokio::test(start_paused = true)]
async fn test_status_tick_reports_lag_from_last_processed_offset() {
    // a topic no other test uses, the recorder is shared
    const LAGGING: &str = "lagging.dev";
    snapshotter();

    let handler = Arc::new(RecordingBatchHandler::default());
    let harness = Harness::start(
        batch_registry(LAGGING, handler.clone(), small_policy()),
        settings(),
        Partition::new(LAGGING, 2),
    );
    harness
        .client
        .set_high_watermark(Partition::new(LAGGING, 2), 10);

    harness.send(record_at(LAGGING, 2, 0)).await;
    sleep(Duration::from_millis(1500)).await;

    // a tick ran, but nothing has been processed yet
    assert!(harness
        .progress
        .last_processed(&Partition::new(LAGGING, 2))
        .is_none());
    assert_eq!(lag_gauge(LAGGING, 2), None);

    harness.send(record_at(LAGGING, 2, 1)).await;
    harness.send(record_at(LAGGING, 2, 2)).await;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(handler.handled_offsets(), vec![0, 1, 2]);
    assert_eq!(lag_gauge(LAGGING, 2), Some(8.0));

    harness.client.set_high_watermark(Partition::new(LAGGING, 2), 25);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(lag_gauge(LAGGING, 2), Some(23.0));

    harness.stop().await;
}
