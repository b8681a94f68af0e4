//! Cost and token accounting for a conversation.
//!
//! A [`Metrics`] value is a cheap-to-clone handle over shared storage.
//! Parent controllers hand clones of the handle to their delegates so that a
//! child's spend is visible to the parent immediately; this aliasing is
//! deliberate and is what the budget flag reads.

use std::sync::Arc;
use std::sync::Mutex;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cost {
    pub model: String,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

/// Round-trip time of one completion call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseLatency {
    pub model: String,
    pub latency: f64,
    pub response_id: String,
}

/// Token usage of one completion call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TokensUsage {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cache_read_tokens: u64,
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub context_window: u64,
    #[serde(default)]
    pub response_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Deep copy of the accounting at one point in time. This is also the wire
/// shape persisted to `metrics.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub accumulated_cost: f64,
    pub costs: Vec<Cost>,
    pub response_latencies: Vec<ResponseLatency>,
    pub tokens_usages: Vec<TokensUsage>,
    pub accumulated_prompt_tokens: u64,
    pub accumulated_completion_tokens: u64,
    pub accumulated_cache_read_tokens: u64,
    pub accumulated_cache_write_tokens: u64,
}

impl MetricsSnapshot {
    pub fn is_empty(&self) -> bool {
        self.accumulated_cost == 0.0 && self.costs.is_empty() && self.tokens_usages.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Metrics {
    model_name: String,
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new("default")
    }
}

/// Handles serialize as their current snapshot and deserialize into a fresh
/// (unshared) handle; aliasing is a runtime property and is re-established
/// by whoever wires controllers together.
impl Serialize for Metrics {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        MetricsSer {
            model_name: self.model_name.clone(),
            snapshot: self.snapshot(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Metrics {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let ser = MetricsSer::deserialize(deserializer)?;
        Ok(Metrics::from_snapshot(ser.model_name, ser.snapshot))
    }
}

#[derive(Serialize, Deserialize)]
struct MetricsSer {
    model_name: String,
    #[serde(flatten)]
    snapshot: MetricsSnapshot,
}

impl PartialEq for Metrics {
    fn eq(&self, other: &Self) -> bool {
        self.model_name == other.model_name && self.snapshot() == other.snapshot()
    }
}

impl Metrics {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn from_snapshot(model_name: impl Into<String>, snapshot: MetricsSnapshot) -> Self {
        Self {
            model_name: model_name.into(),
            inner: Arc::new(Mutex::new(snapshot)),
        }
    }

    /// Two handles are aliases when they share storage. Used by tests to
    /// assert the parent/delegate sharing contract.
    pub fn shares_storage_with(&self, other: &Metrics) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn accumulated_cost(&self) -> f64 {
        self.with_inner(|inner| inner.accumulated_cost)
    }

    /// Record the cost of one completion call. Negative values are dropped:
    /// accumulated cost is monotonic non-decreasing by contract.
    pub fn add_cost(&self, value: f64) {
        if value < 0.0 {
            warn!("discarding negative cost delta: {value}");
            return;
        }
        let model = self.model_name.clone();
        self.with_inner(|inner| {
            inner.accumulated_cost += value;
            inner.costs.push(Cost {
                model,
                cost: value,
                timestamp: Utc::now(),
            });
        });
    }

    pub fn add_response_latency(&self, latency: f64, response_id: impl Into<String>) {
        let record = ResponseLatency {
            model: self.model_name.clone(),
            latency: latency.max(0.0),
            response_id: response_id.into(),
        };
        self.with_inner(|inner| inner.response_latencies.push(record));
    }

    pub fn add_tokens_usage(
        &self,
        prompt_tokens: u64,
        completion_tokens: u64,
        cache_read_tokens: u64,
        cache_write_tokens: u64,
        context_window: u64,
        response_id: impl Into<String>,
    ) {
        let usage = TokensUsage {
            model: self.model_name.clone(),
            prompt_tokens,
            completion_tokens,
            cache_read_tokens,
            cache_write_tokens,
            context_window,
            response_id: response_id.into(),
            timestamp: Utc::now(),
        };
        self.with_inner(|inner| {
            inner.accumulated_prompt_tokens += prompt_tokens;
            inner.accumulated_completion_tokens += completion_tokens;
            inner.accumulated_cache_read_tokens += cache_read_tokens;
            inner.accumulated_cache_write_tokens += cache_write_tokens;
            inner.tokens_usages.push(usage);
        });
    }

    /// Fold another accounting into this one. Used when restoring a saved
    /// session merges the persisted snapshot into the live handle.
    pub fn merge(&self, other: &MetricsSnapshot) {
        let other = other.clone();
        self.with_inner(|inner| {
            inner.accumulated_cost += other.accumulated_cost;
            inner.costs.extend(other.costs);
            inner.response_latencies.extend(other.response_latencies);
            inner.tokens_usages.extend(other.tokens_usages);
            inner.accumulated_prompt_tokens += other.accumulated_prompt_tokens;
            inner.accumulated_completion_tokens += other.accumulated_completion_tokens;
            inner.accumulated_cache_read_tokens += other.accumulated_cache_read_tokens;
            inner.accumulated_cache_write_tokens += other.accumulated_cache_write_tokens;
        });
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.with_inner(|inner| inner.clone())
    }

    fn with_inner<R>(&self, f: impl FnOnce(&mut MetricsSnapshot) -> R) -> R {
        // A poisoned metrics lock means a writer panicked mid-update; the
        // accounting is still self-consistent enough to read, so recover.
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}
