use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};

use crate::kafka::record::Record;
use crate::policy::{BatchPolicy, PolicyOverride, TopicPolicyOverrides};

/// Handles one record at a time, as soon as it is delivered.
#[async_trait]
pub trait ImmediateHandler: Send + Sync {
    async fn handle(&self, value: &[u8], topic: &str) -> Result<()>;
}

/// Handles accumulated records of one topic-partition in arrival order.
///
/// A failed batch is replayed whole, so implementations must tolerate
/// seeing the same records more than once.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(
        &self,
        topic: &str,
        records: &[Record],
        partition: i32,
        worker_id: usize,
    ) -> Result<()>;
}

#[derive(Clone)]
pub enum HandlerBinding {
    Immediate(Arc<dyn ImmediateHandler>),
    Batch {
        handler: Arc<dyn BatchHandler>,
        policy: BatchPolicy,
    },
}

impl HandlerBinding {
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerBinding::Immediate(_) => "immediate",
            HandlerBinding::Batch { .. } => "batch",
        }
    }
}

impl fmt::Debug for HandlerBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerBinding::Immediate(_) => f.write_str("Immediate"),
            HandlerBinding::Batch { policy, .. } => {
                f.debug_struct("Batch").field("policy", policy).finish()
            }
        }
    }
}

/// Topic -> handler table. Filled in once before consumption starts and
/// shared read-only (behind an `Arc`) afterwards.
#[derive(Default)]
pub struct HandlerRegistry {
    bindings: HashMap<String, HandlerBinding>,
    defaults: BatchPolicy,
    overrides: TopicPolicyOverrides,
}

impl HandlerRegistry {
    pub fn new(defaults: BatchPolicy) -> Self {
        Self {
            bindings: HashMap::new(),
            defaults,
            overrides: TopicPolicyOverrides::default(),
        }
    }

    /// Operator-supplied per-topic limits; they win over the values passed to `register_batch`.
    pub fn with_overrides(mut self, overrides: TopicPolicyOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn register_immediate(
        &mut self,
        topic: impl Into<String>,
        handler: Arc<dyn ImmediateHandler>,
    ) {
        self.bind(topic.into(), HandlerBinding::Immediate(handler));
    }

    /// Unset limits fall back to the registry defaults (100 / 50 / 5s unless configured).
    pub fn register_batch(
        &mut self,
        topic: impl Into<String>,
        handler: Arc<dyn BatchHandler>,
        max_batch_size: Option<usize>,
        min_batch_size: Option<usize>,
        batch_timeout: Option<Duration>,
    ) {
        let topic = topic.into();
        let requested = PolicyOverride::new(max_batch_size, min_batch_size, batch_timeout);
        let policy = self
            .defaults
            .resolve(&topic, &requested, self.overrides.get(&topic));

        self.bind(topic, HandlerBinding::Batch { handler, policy });
    }

    fn bind(&mut self, topic: String, binding: HandlerBinding) {
        if topic.is_empty() {
            warn!("Ignoring {} handler registered without a topic", binding.kind());
            return;
        }

        info!(topic = topic, binding = ?binding, "Registered handler");

        if let Some(previous) = self.bindings.insert(topic.clone(), binding) {
            warn!(
                topic = topic,
                previous = previous.kind(),
                "Handler re-registered, previous binding replaced"
            );
        }
    }

    pub fn binding(&self, topic: &str) -> Option<&HandlerBinding> {
        self.bindings.get(topic)
    }

    /// The fixed topic set handed to the consumer group subscription, sorted.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.bindings.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }
}
