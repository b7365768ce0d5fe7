//! Counters and latency figures for extraction calls.
//!
//! Keys follow a path-like layout so that they aggregate nicely in crawl
//! stats, e.g. `autoextract/total/pages/count` or
//! `autoextract/article/pages/errors`.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::{Value, json};

#[derive(Debug, Default, Clone, Copy)]
struct Latency {
    count: u64,
    total: Duration,
    max: Duration,
}

impl Latency {
    fn average(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.count);
        u64::try_from(nanos).map_or(self.max, Duration::from_nanos)
    }
}

/// Thread-safe stats shared by both call paths.
#[derive(Debug, Default)]
pub struct ExtractionStats {
    counters: DashMap<String, u64>,
    latency: Mutex<Latency>,
}

impl ExtractionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_value(&self, key: impl Into<String>) {
        self.inc_by(key, 1);
    }

    pub fn inc_by(&self, key: impl Into<String>, amount: u64) {
        *self.counters.entry(key.into()).or_insert(0) += amount;
    }

    /// Current value of a counter, zero when it was never touched.
    pub fn get_value(&self, key: &str) -> u64 {
        self.counters.get(key).map(|v| *v.value()).unwrap_or(0)
    }

    /// Records the latency of one successful API response.
    pub fn record_latency(&self, latency: Duration) {
        let mut state = self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        state.count += 1;
        state.total += latency;
        state.max = state.max.max(latency);
    }

    pub fn response_count(&self) -> u64 {
        self.latency_snapshot().count
    }

    pub fn avg_latency(&self) -> Duration {
        self.latency_snapshot().average()
    }

    pub fn max_latency(&self) -> Duration {
        self.latency_snapshot().max
    }

    fn latency_snapshot(&self) -> Latency {
        *self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// All figures, sorted by key.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        let mut values: BTreeMap<String, Value> = self
            .counters
            .iter()
            .map(|entry| (entry.key().clone(), json!(*entry.value())))
            .collect();
        if self.response_count() > 0 {
            values.insert("autoextract/response_count".into(), json!(self.response_count()));
            values.insert(
                "autoextract/response_avg_latency".into(),
                json!(self.avg_latency().as_secs_f64()),
            );
            values.insert(
                "autoextract/response_max_latency".into(),
                json!(self.max_latency().as_secs_f64()),
            );
        }
        values
    }

    pub fn to_json_string_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.snapshot())
    }
}
