//! Metrics primitives, registry, and Prometheus text exposition.
//!
//! Provides lightweight metric types (counter, gauge, histogram) plus
//! labeled families, and a registry to create, retrieve, and render them.
//! Values live in-memory behind atomics; the registry renders the
//! Prometheus text format directly, no exporter process required.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use parking_lot::RwLock;

/// Default histogram buckets, in seconds. Tuned for task runtimes that
/// range from sub-second dispatches to multi-minute applies.
pub const DEFAULT_BUCKETS: &[f64] = &[0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 300.0];

/// An incrementing counter.
#[derive(Debug, Clone, Default)]
pub struct Counter {
    value: Arc<AtomicU64>,
}

impl Counter {
    /// Create a new counter starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by a given amount.
    pub fn inc_by(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A gauge that can go up and down.
#[derive(Debug, Clone, Default)]
pub struct Gauge {
    value: Arc<AtomicI64>,
}

impl Gauge {
    /// Create a new gauge starting at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment by one.
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by one.
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Set to a specific value.
    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    /// Current value.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A fixed-bucket histogram.
///
/// Observations land in cumulative buckets; sum is tracked in micro-units
/// so it can live in an atomic alongside the counts.
#[derive(Debug, Clone)]
pub struct Histogram {
    buckets: Arc<Vec<f64>>,
    counts: Arc<Vec<AtomicU64>>,
    sum_micros: Arc<AtomicU64>,
    total: Arc<AtomicU64>,
}

impl Histogram {
    /// Create a histogram with [`DEFAULT_BUCKETS`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKETS)
    }

    /// Create a histogram with custom upper bounds (must be sorted).
    #[must_use]
    pub fn with_buckets(bounds: &[f64]) -> Self {
        Self {
            buckets: Arc::new(bounds.to_vec()),
            counts: Arc::new((0..bounds.len()).map(|_| AtomicU64::new(0)).collect()),
            sum_micros: Arc::new(AtomicU64::new(0)),
            total: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Record an observation.
    pub fn observe(&self, value: f64) {
        for (bound, count) in self.buckets.iter().zip(self.counts.iter()) {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.total.fetch_add(1, Ordering::Relaxed);
        let micros = (value * 1_000_000.0).max(0.0) as u64;
        self.sum_micros.fetch_add(micros, Ordering::Relaxed);
    }

    /// Number of observations recorded.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Sum of all observations.
    #[must_use]
    pub fn sum(&self) -> f64 {
        self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    fn bucket_counts(&self) -> Vec<(f64, u64)> {
        self.buckets
            .iter()
            .zip(self.counts.iter())
            .map(|(b, c)| (*b, c.load(Ordering::Relaxed)))
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// A family of counters sharing a name, split by label values.
#[derive(Debug, Clone)]
pub struct CounterVec {
    label_names: Arc<Vec<String>>,
    children: Arc<RwLock<BTreeMap<Vec<String>, Counter>>>,
}

impl CounterVec {
    fn new(label_names: &[&str]) -> Self {
        Self {
            label_names: Arc::new(label_names.iter().map(|s| (*s).to_owned()).collect()),
            children: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Get or create the child counter for the given label values.
    ///
    /// The number of values must match the family's label names.
    pub fn with(&self, values: &[&str]) -> Counter {
        debug_assert_eq!(values.len(), self.label_names.len());
        let key: Vec<String> = values.iter().map(|s| (*s).to_owned()).collect();
        if let Some(c) = self.children.read().get(&key) {
            return c.clone();
        }
        self.children.write().entry(key).or_default().clone()
    }

    /// Sum over every child of the family.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.children.read().values().map(Counter::get).sum()
    }
}

/// A family of gauges sharing a name, split by label values.
#[derive(Debug, Clone)]
pub struct GaugeVec {
    label_names: Arc<Vec<String>>,
    children: Arc<RwLock<BTreeMap<Vec<String>, Gauge>>>,
}

impl GaugeVec {
    fn new(label_names: &[&str]) -> Self {
        Self {
            label_names: Arc::new(label_names.iter().map(|s| (*s).to_owned()).collect()),
            children: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Get or create the child gauge for the given label values.
    pub fn with(&self, values: &[&str]) -> Gauge {
        debug_assert_eq!(values.len(), self.label_names.len());
        let key: Vec<String> = values.iter().map(|s| (*s).to_owned()).collect();
        if let Some(g) = self.children.read().get(&key) {
            return g.clone();
        }
        self.children.write().entry(key).or_default().clone()
    }

    /// Set `value` to 1 for the given label values and 0 for every other
    /// child. Used for state-style gauges where exactly one label is
    /// current (`circuit_state`, `runtime_mode`).
    pub fn set_exclusive(&self, values: &[&str]) {
        let key: Vec<String> = values.iter().map(|s| (*s).to_owned()).collect();
        let mut children = self.children.write();
        children.entry(key.clone()).or_default();
        for (k, g) in children.iter() {
            g.set(i64::from(*k == key));
        }
    }
}

/// Registry for creating, retrieving, and rendering named metrics.
///
/// Retrieving the same name twice returns handles to the same metric.
/// Cloning the registry is cheap and shares the underlying metrics, which
/// is how it flows through dependency injection.
#[derive(Debug, Clone, Default)]
pub struct MetricsRegistry {
    counters: Arc<RwLock<HashMap<String, Counter>>>,
    gauges: Arc<RwLock<HashMap<String, Gauge>>>,
    histograms: Arc<RwLock<HashMap<String, Histogram>>>,
    counter_vecs: Arc<RwLock<HashMap<String, CounterVec>>>,
    gauge_vecs: Arc<RwLock<HashMap<String, GaugeVec>>>,
}

impl MetricsRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a counter by name.
    pub fn counter(&self, name: &str) -> Counter {
        self.counters
            .write()
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Get or create a gauge by name.
    pub fn gauge(&self, name: &str) -> Gauge {
        self.gauges
            .write()
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Get or create a histogram by name.
    pub fn histogram(&self, name: &str) -> Histogram {
        self.histograms
            .write()
            .entry(name.to_owned())
            .or_default()
            .clone()
    }

    /// Get or create a labeled counter family by name.
    pub fn counter_vec(&self, name: &str, label_names: &[&str]) -> CounterVec {
        self.counter_vecs
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| CounterVec::new(label_names))
            .clone()
    }

    /// Get or create a labeled gauge family by name.
    pub fn gauge_vec(&self, name: &str, label_names: &[&str]) -> GaugeVec {
        self.gauge_vecs
            .write()
            .entry(name.to_owned())
            .or_insert_with(|| GaugeVec::new(label_names))
            .clone()
    }

    /// Render every registered metric in the Prometheus text format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        let mut counters: Vec<_> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.get()))
            .collect();
        counters.sort();
        for (name, value) in counters {
            let _ = writeln!(out, "# TYPE {name} counter");
            let _ = writeln!(out, "{name} {value}");
        }

        let mut gauges: Vec<_> = self
            .gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.get()))
            .collect();
        gauges.sort();
        for (name, value) in gauges {
            let _ = writeln!(out, "# TYPE {name} gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        let mut counter_vecs: Vec<_> = self
            .counter_vecs
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        counter_vecs.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, family) in counter_vecs {
            let _ = writeln!(out, "# TYPE {name} counter");
            for (values, child) in family.children.read().iter() {
                let labels = format_labels(&family.label_names, values);
                let _ = writeln!(out, "{name}{{{labels}}} {}", child.get());
            }
        }

        let mut gauge_vecs: Vec<_> = self
            .gauge_vecs
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        gauge_vecs.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, family) in gauge_vecs {
            let _ = writeln!(out, "# TYPE {name} gauge");
            for (values, child) in family.children.read().iter() {
                let labels = format_labels(&family.label_names, values);
                let _ = writeln!(out, "{name}{{{labels}}} {}", child.get());
            }
        }

        let mut histograms: Vec<_> = self
            .histograms
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        histograms.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, hist) in histograms {
            let _ = writeln!(out, "# TYPE {name} histogram");
            for (bound, count) in hist.bucket_counts() {
                let _ = writeln!(out, "{name}_bucket{{le=\"{bound}\"}} {count}");
            }
            let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", hist.count());
            let _ = writeln!(out, "{name}_sum {}", hist.sum());
            let _ = writeln!(out, "{name}_count {}", hist.count());
        }

        out
    }
}

fn format_labels(names: &[String], values: &[String]) -> String {
    names
        .iter()
        .zip(values.iter())
        .map(|(n, v)| format!("{n}=\"{}\"", escape_label(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let c = Counter::new();
        c.inc();
        c.inc_by(5);
        assert_eq!(c.get(), 6);
    }

    #[test]
    fn gauge_up_down_set() {
        let g = Gauge::new();
        g.inc();
        g.inc();
        g.dec();
        assert_eq!(g.get(), 1);
        g.set(42);
        assert_eq!(g.get(), 42);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let h = Histogram::with_buckets(&[1.0, 5.0]);
        h.observe(0.5);
        h.observe(3.0);
        h.observe(100.0);

        let counts = h.bucket_counts();
        assert_eq!(counts[0], (1.0, 1));
        assert_eq!(counts[1], (5.0, 2));
        assert_eq!(h.count(), 3);
        assert!((h.sum() - 103.5).abs() < 1e-6);
    }

    #[test]
    fn registry_returns_same_metric_for_same_name() {
        let reg = MetricsRegistry::new();
        reg.counter("requests").inc();
        assert_eq!(reg.counter("requests").get(), 1);
    }

    #[test]
    fn counter_vec_children_are_independent() {
        let reg = MetricsRegistry::new();
        let family = reg.counter_vec("rejections", &["reason"]);
        family.with(&["queue_full"]).inc();
        family.with(&["queue_full"]).inc();
        family.with(&["circuit_open"]).inc();

        assert_eq!(family.with(&["queue_full"]).get(), 2);
        assert_eq!(family.with(&["circuit_open"]).get(), 1);
    }

    #[test]
    fn gauge_vec_set_exclusive() {
        let reg = MetricsRegistry::new();
        let family = reg.gauge_vec("mode", &["mode"]);
        family.set_exclusive(&["normal"]);
        family.set_exclusive(&["freeze"]);

        assert_eq!(family.with(&["normal"]).get(), 0);
        assert_eq!(family.with(&["freeze"]).get(), 1);
    }

    #[test]
    fn render_plain_counter_and_gauge() {
        let reg = MetricsRegistry::new();
        reg.counter("flux_task_success_total").inc();
        reg.gauge("flux_scheduler_queue_depth").set(3);

        let text = reg.render();
        assert!(text.contains("# TYPE flux_task_success_total counter"));
        assert!(text.contains("flux_task_success_total 1"));
        assert!(text.contains("flux_scheduler_queue_depth 3"));
    }

    #[test]
    fn render_labeled_counter() {
        let reg = MetricsRegistry::new();
        reg.counter_vec("flux_scheduler_rejections_total", &["reason"])
            .with(&["queue_full"])
            .inc();

        let text = reg.render();
        assert!(text.contains("flux_scheduler_rejections_total{reason=\"queue_full\"} 1"));
    }

    #[test]
    fn render_histogram_has_inf_bucket() {
        let reg = MetricsRegistry::new();
        reg.histogram("flux_task_runtime_seconds").observe(0.2);

        let text = reg.render();
        assert!(text.contains("# TYPE flux_task_runtime_seconds histogram"));
        assert!(text.contains("flux_task_runtime_seconds_bucket{le=\"+Inf\"} 1"));
        assert!(text.contains("flux_task_runtime_seconds_count 1"));
    }

    #[test]
    fn label_values_are_escaped() {
        let reg = MetricsRegistry::new();
        reg.counter_vec("errors", &["detail"])
            .with(&["say \"hi\""])
            .inc();

        let text = reg.render();
        assert!(text.contains("errors{detail=\"say \\\"hi\\\"\"} 1"));
    }

    #[test]
    fn cloned_registry_shares_metrics() {
        let reg = MetricsRegistry::new();
        let clone = reg.clone();
        clone.counter("shared").inc();
        assert_eq!(reg.counter("shared").get(), 1);
    }
}
