use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;
pub const DEFAULT_MIN_BATCH_SIZE: usize = 50;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Size and time limits for one batch topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    pub max_batch_size: usize,
    pub min_batch_size: usize,
    pub batch_timeout: Duration,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            min_batch_size: DEFAULT_MIN_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
        }
    }
}

impl BatchPolicy {
    pub fn new(max_batch_size: usize, min_batch_size: usize, batch_timeout: Duration) -> Self {
        Self {
            max_batch_size,
            min_batch_size,
            batch_timeout,
        }
    }

    /// Field-by-field precedence: `preferred`, then `requested`, then `self`.
    /// A minimum above the maximum is clamped down to the maximum.
    pub fn resolve(
        &self,
        topic: &str,
        requested: &PolicyOverride,
        preferred: Option<&PolicyOverride>,
    ) -> BatchPolicy {
        let pick = |get: fn(&PolicyOverride) -> Option<usize>, fallback: usize| {
            preferred
                .and_then(get)
                .or_else(|| get(requested))
                .unwrap_or(fallback)
        };

        let max_batch_size = pick(|o| o.max_batch_size, self.max_batch_size).max(1);
        let mut min_batch_size = pick(|o| o.min_batch_size, self.min_batch_size);
        let batch_timeout = preferred
            .and_then(|o| o.batch_timeout)
            .or(requested.batch_timeout)
            .unwrap_or(self.batch_timeout);

        if min_batch_size > max_batch_size {
            warn!(
                topic = topic,
                min_batch_size = min_batch_size,
                max_batch_size = max_batch_size,
                "Minimum batch size exceeds maximum, clamping to maximum"
            );
            min_batch_size = max_batch_size;
        }

        BatchPolicy {
            max_batch_size,
            min_batch_size,
            batch_timeout,
        }
    }

    pub fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::InvalidPolicy {
                scope: scope.to_string(),
                reason: "max batch size must be positive".to_string(),
            });
        }
        if self.min_batch_size > self.max_batch_size {
            return Err(ConfigError::InvalidPolicy {
                scope: scope.to_string(),
                reason: format!(
                    "min batch size {} exceeds max batch size {}",
                    self.min_batch_size, self.max_batch_size
                ),
            });
        }
        Ok(())
    }
}

/// Partial policy; unset fields fall through to the next source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PolicyOverride {
    pub max_batch_size: Option<usize>,
    pub min_batch_size: Option<usize>,
    pub batch_timeout: Option<Duration>,
}

impl PolicyOverride {
    pub fn new(
        max_batch_size: Option<usize>,
        min_batch_size: Option<usize>,
        batch_timeout: Option<Duration>,
    ) -> Self {
        Self {
            max_batch_size,
            min_batch_size,
            batch_timeout,
        }
    }
}

/// Per-topic overrides parsed from `topic:max:min:timeout_ms` entries separated by commas.
/// Empty fields are left unset, e.g. `trades:200::` only overrides the maximum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicPolicyOverrides(HashMap<String, PolicyOverride>);

impl TopicPolicyOverrides {
    pub fn get(&self, topic: &str) -> Option<&PolicyOverride> {
        self.0.get(topic)
    }

    pub fn insert(&mut self, topic: impl Into<String>, policy: PolicyOverride) {
        self.0.insert(topic.into(), policy);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PolicyOverride)> {
        self.0.iter()
    }

    /// Re-keys every entry through `resolve`, used to turn logical names into broker topics.
    pub fn map_topics(self, resolve: impl Fn(&str) -> String) -> Self {
        Self(
            self.0
                .into_iter()
                .map(|(topic, policy)| (resolve(&topic), policy))
                .collect(),
        )
    }
}

fn parse_field<T: FromStr>(entry: &str, raw: &str, name: &str) -> Result<Option<T>, ConfigError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::InvalidOverride {
            entry: entry.to_string(),
            reason: format!("{name} '{raw}' is not a non-negative integer"),
        })
}

impl FromStr for TopicPolicyOverrides {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut overrides = HashMap::new();

        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let fields: Vec<&str> = entry.split(':').collect();
            let [topic, max, min, timeout] = fields.as_slice() else {
                return Err(ConfigError::InvalidOverride {
                    entry: entry.to_string(),
                    reason: "expected topic:max:min:timeout_ms".to_string(),
                });
            };

            let topic = topic.trim();
            if topic.is_empty() {
                return Err(ConfigError::InvalidOverride {
                    entry: entry.to_string(),
                    reason: "topic name is empty".to_string(),
                });
            }

            let policy = PolicyOverride {
                max_batch_size: parse_field(entry, max, "max")?,
                min_batch_size: parse_field(entry, min, "min")?,
                batch_timeout: parse_field::<u64>(entry, timeout, "timeout_ms")?
                    .map(Duration::from_millis),
            };

            if policy.max_batch_size == Some(0) {
                return Err(ConfigError::InvalidOverride {
                    entry: entry.to_string(),
                    reason: "max must be positive".to_string(),
                });
            }

            overrides.insert(topic.to_string(), policy);
        }

        Ok(Self(overrides))
    }
}
