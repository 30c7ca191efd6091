use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Observations kept per histogram for percentile estimates. Count and sum
/// cover every observation; percentiles cover the most recent window.
const HISTOGRAM_WINDOW: usize = 4096;

/// Monotonic counter.
struct Counter {
    value: AtomicU64,
}

impl Counter {
    fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }
}

/// Integer gauge; connection counts and queue depths never need fractions.
struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }
}

struct HistogramState {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    window: VecDeque<f64>,
}

struct Histogram {
    state: Mutex<HistogramState>,
}

impl Histogram {
    fn new() -> Self {
        Self {
            state: Mutex::new(HistogramState {
                count: 0,
                sum: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                window: VecDeque::new(),
            }),
        }
    }

    fn observe(&self, value: f64) {
        let mut s = self.state.lock();
        s.count += 1;
        s.sum += value;
        s.min = s.min.min(value);
        s.max = s.max.max(value);
        if s.window.len() == HISTOGRAM_WINDOW {
            s.window.pop_front();
        }
        s.window.push_back(value);
    }

    fn summary(&self) -> HistogramSummary {
        let s = self.state.lock();
        if s.count == 0 {
            return HistogramSummary::default();
        }
        let mut sorted: Vec<f64> = s.window.iter().copied().collect();
        sorted.sort_by(f64::total_cmp);
        let pick = |q: f64| {
            let idx = ((sorted.len() as f64 * q) as usize).min(sorted.len() - 1);
            sorted[idx]
        };
        HistogramSummary {
            count: s.count,
            sum: s.sum,
            min: s.min,
            max: s.max,
            p50: pick(0.50),
            p95: pick(0.95),
            p99: pick(0.99),
        }
    }
}

/// Summary statistics from a histogram.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistogramSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Metric identity: name plus sorted labels.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut sorted: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        sorted.sort();
        Self {
            name: name.to_string(),
            labels: sorted,
        }
    }

    fn label_map(&self) -> HashMap<String, String> {
        self.labels.iter().cloned().collect()
    }
}

/// One labelled value in a [`MetricsReport`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sample<T> {
    pub name: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    pub value: T,
}

/// Point-in-time view of every metric, served by the admin endpoint.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricsReport {
    pub taken_at: String,
    pub counters: Vec<Sample<u64>>,
    pub gauges: Vec<Sample<i64>>,
    pub histograms: Vec<Sample<HistogramSummary>>,
}

/// Thread-safe in-memory metrics recorder.
///
/// Lookups take a read lock; the write lock is only taken the first time a
/// name/label combination is seen.
#[derive(Default)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, Counter>>,
    gauges: RwLock<HashMap<MetricKey, Gauge>>,
    histograms: RwLock<HashMap<MetricKey, Histogram>>,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(c) = self.counters.read().get(&key) {
            c.value.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(Counter::new)
            .value
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        let key = MetricKey::new(name, labels);
        self.counters
            .read()
            .get(&key)
            .map_or(0, |c| c.value.load(Ordering::Relaxed))
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: i64) {
        self.with_gauge(name, labels, |g| g.value.store(value, Ordering::Relaxed));
    }

    /// Add `delta` (may be negative) to a gauge.
    pub fn gauge_add(&self, name: &str, labels: &[(&str, &str)], delta: i64) {
        self.with_gauge(name, labels, |g| {
            g.value.fetch_add(delta, Ordering::Relaxed);
        });
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> i64 {
        let key = MetricKey::new(name, labels);
        self.gauges
            .read()
            .get(&key)
            .map_or(0, |g| g.value.load(Ordering::Relaxed))
    }

    pub fn histogram_observe(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(h) = self.histograms.read().get(&key) {
            h.observe(value);
            return;
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(Histogram::new)
            .observe(value);
    }

    pub fn histogram_summary(&self, name: &str, labels: &[(&str, &str)]) -> HistogramSummary {
        let key = MetricKey::new(name, labels);
        self.histograms
            .read()
            .get(&key)
            .map(Histogram::summary)
            .unwrap_or_default()
    }

    /// Capture every metric, sorted by name then labels.
    pub fn report(&self) -> MetricsReport {
        let mut counters: Vec<_> = self
            .counters
            .read()
            .iter()
            .map(|(k, c)| (k.clone(), c.value.load(Ordering::Relaxed)))
            .collect();
        counters.sort_by(|a, b| (&a.0.name, &a.0.labels).cmp(&(&b.0.name, &b.0.labels)));

        let mut gauges: Vec<_> = self
            .gauges
            .read()
            .iter()
            .map(|(k, g)| (k.clone(), g.value.load(Ordering::Relaxed)))
            .collect();
        gauges.sort_by(|a, b| (&a.0.name, &a.0.labels).cmp(&(&b.0.name, &b.0.labels)));

        let mut histograms: Vec<_> = self
            .histograms
            .read()
            .iter()
            .map(|(k, h)| (k.clone(), h.summary()))
            .collect();
        histograms.sort_by(|a, b| (&a.0.name, &a.0.labels).cmp(&(&b.0.name, &b.0.labels)));

        MetricsReport {
            taken_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            counters: counters.into_iter().map(into_sample).collect(),
            gauges: gauges.into_iter().map(into_sample).collect(),
            histograms: histograms.into_iter().map(into_sample).collect(),
        }
    }

    fn with_gauge(&self, name: &str, labels: &[(&str, &str)], f: impl FnOnce(&Gauge)) {
        let key = MetricKey::new(name, labels);
        if let Some(g) = self.gauges.read().get(&key) {
            f(g);
            return;
        }
        let mut gauges = self.gauges.write();
        f(gauges.entry(key).or_insert_with(Gauge::new));
    }
}

fn into_sample<T>((key, value): (MetricKey, T)) -> Sample<T> {
    Sample {
        labels: key.label_map(),
        name: key.name,
        value,
    }
}
