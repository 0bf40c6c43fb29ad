//! # Metric Types and Instruments
//!
//! The four Prometheus metric types, the gauge merge modes, and thin
//! instrument objects (`Counter`, `Gauge`, `Histogram`, `Summary`) that
//! record observations through the process-wide registry.
//!
//! The instruments are deliberately small. They cache one value handle per
//! label set and delegate everything else: key canonicalization to the key
//! codec, storage to the registry. Recording errors are logged and
//! swallowed so an unwritable metrics directory never takes down a worker.
//!
//! ## File Prefixes
//!
//! Each (type, mode) pair maps to the file prefix the registry writes
//! under, which in turn is what the aggregator parses back out of
//! filenames:
//!
//! ```text
//! counter            counter_<pid>-<n>.db
//! histogram          histogram_<pid>-<n>.db
//! summary            summary_<pid>-<n>.db
//! gauge + mode       gauge_<mode>_<pid>-<n>.db
//! ```

use std::str::FromStr;
use std::sync::Arc;

use eyre::{bail, Report};
use hashbrown::HashMap;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::keys::encode_key;
use crate::registry::{MmapedValue, ValueStore};

/// The Prometheus metric type, as encoded in file prefixes and emitted in
/// `# TYPE` lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricType {
    pub fn as_str(self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
        }
    }
}

impl FromStr for MetricType {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Report> {
        Ok(match s {
            "counter" => MetricType::Counter,
            "gauge" => MetricType::Gauge,
            "histogram" => MetricType::Histogram,
            "summary" => MetricType::Summary,
            other => bail!("unknown metric type '{other}'"),
        })
    }
}

/// How gauge samples from different processes merge during aggregation.
/// Non-gauge types always sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MultiprocessMode {
    Min,
    Max,
    Livesum,
    /// One sample per process, pid label attached; files from dead
    /// processes are expected to be cleaned up externally.
    Liveall,
    /// One sample per process, pid label attached.
    All,
}

impl MultiprocessMode {
    pub fn as_str(self) -> &'static str {
        match self {
            MultiprocessMode::Min => "min",
            MultiprocessMode::Max => "max",
            MultiprocessMode::Livesum => "livesum",
            MultiprocessMode::Liveall => "liveall",
            MultiprocessMode::All => "all",
        }
    }

    /// True when per-process samples stay separate and carry a pid label.
    pub fn pid_significant(self) -> bool {
        matches!(self, MultiprocessMode::All | MultiprocessMode::Liveall)
    }
}

impl FromStr for MultiprocessMode {
    type Err = Report;

    fn from_str(s: &str) -> Result<Self, Report> {
        Ok(match s {
            "min" => MultiprocessMode::Min,
            "max" => MultiprocessMode::Max,
            "livesum" => MultiprocessMode::Livesum,
            "liveall" => MultiprocessMode::Liveall,
            "all" => MultiprocessMode::All,
            other => bail!("unknown multiprocess mode '{other}'"),
        })
    }
}

/// The file prefix for a metric type and, for gauges, its merge mode.
pub fn file_prefix(metric_type: MetricType, mode: Option<MultiprocessMode>) -> String {
    match (metric_type, mode) {
        (MetricType::Gauge, Some(mode)) => format!("gauge_{}", mode.as_str()),
        (metric_type, _) => metric_type.as_str().to_string(),
    }
}

type LabelValues = SmallVec<[String; 4]>;

/// Cache of one value handle per observed label set.
#[derive(Debug)]
struct Children<T>(Mutex<HashMap<LabelValues, Arc<T>>>);

impl<T> Default for Children<T> {
    fn default() -> Self {
        Children(Mutex::new(HashMap::new()))
    }
}

impl<T> Children<T> {
    fn get_or_insert(&self, values: &[&str], build: impl FnOnce() -> T) -> Arc<T> {
        let key: LabelValues = values.iter().map(|v| v.to_string()).collect();
        self.0
            .lock()
            .entry(key)
            .or_insert_with(|| Arc::new(build()))
            .clone()
    }
}

fn paired<'a>(names: &'a [String], values: &'a [&'a str]) -> Vec<(&'a str, &'a str)> {
    names
        .iter()
        .map(String::as_str)
        .zip(values.iter().copied())
        .collect()
}

/// A monotonically increasing counter.
#[derive(Debug)]
pub struct Counter {
    name: String,
    label_names: Vec<String>,
    children: Children<MmapedValue>,
}

impl Counter {
    pub fn new(name: impl Into<String>, label_names: &[&str]) -> Self {
        Counter {
            name: name.into(),
            label_names: label_names.iter().map(|n| n.to_string()).collect(),
            children: Children::default(),
        }
    }

    pub fn inc(&self, label_values: &[&str]) {
        self.inc_by(label_values, 1.0);
    }

    pub fn inc_by(&self, label_values: &[&str], by: f64) {
        self.value(label_values).increment(by);
    }

    pub fn get(&self, label_values: &[&str]) -> f64 {
        self.value(label_values).get()
    }

    fn value(&self, label_values: &[&str]) -> Arc<MmapedValue> {
        debug_assert_eq!(label_values.len(), self.label_names.len());
        self.children.get_or_insert(label_values, || {
            let labels = paired(&self.label_names, label_values);
            MmapedValue::new(
                MetricType::Counter,
                None,
                encode_key(&self.name, &self.name, &labels),
            )
        })
    }
}

/// A gauge whose cross-process merge rule is fixed at construction.
#[derive(Debug)]
pub struct Gauge {
    name: String,
    label_names: Vec<String>,
    mode: MultiprocessMode,
    children: Children<MmapedValue>,
}

impl Gauge {
    pub fn new(name: impl Into<String>, label_names: &[&str], mode: MultiprocessMode) -> Self {
        Gauge {
            name: name.into(),
            label_names: label_names.iter().map(|n| n.to_string()).collect(),
            mode,
            children: Children::default(),
        }
    }

    pub fn set(&self, label_values: &[&str], value: f64) {
        self.value(label_values).set(value);
    }

    pub fn inc_by(&self, label_values: &[&str], by: f64) {
        self.value(label_values).increment(by);
    }

    pub fn dec_by(&self, label_values: &[&str], by: f64) {
        self.value(label_values).increment(-by);
    }

    pub fn get(&self, label_values: &[&str]) -> f64 {
        self.value(label_values).get()
    }

    fn value(&self, label_values: &[&str]) -> Arc<MmapedValue> {
        debug_assert_eq!(label_values.len(), self.label_names.len());
        self.children.get_or_insert(label_values, || {
            let labels = paired(&self.label_names, label_values);
            MmapedValue::new(
                MetricType::Gauge,
                Some(self.mode),
                encode_key(&self.name, &self.name, &labels),
            )
        })
    }
}

/// Classic duration buckets, seconds.
pub const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

#[derive(Debug)]
struct HistogramChild {
    sum: MmapedValue,
    count: MmapedValue,
    buckets: Vec<(f64, MmapedValue)>,
}

/// A cumulative histogram with fixed upper bounds. Every observation lands
/// in `_sum`, `_count`, and each bucket whose bound covers it, including
/// the `+Inf` bucket that mirrors `_count`.
#[derive(Debug)]
pub struct Histogram {
    name: String,
    label_names: Vec<String>,
    bounds: Vec<f64>,
    children: Children<HistogramChild>,
}

impl Histogram {
    pub fn new(name: impl Into<String>, label_names: &[&str], bounds: &[f64]) -> Self {
        let mut bounds: Vec<f64> = bounds.iter().copied().filter(|b| b.is_finite()).collect();
        bounds.sort_by(|a, b| a.partial_cmp(b).expect("finite bounds"));
        bounds.push(f64::INFINITY);

        Histogram {
            name: name.into(),
            label_names: label_names.iter().map(|n| n.to_string()).collect(),
            bounds,
            children: Children::default(),
        }
    }

    pub fn observe(&self, label_values: &[&str], value: f64) {
        let child = self.child(label_values);
        child.sum.increment(value);
        child.count.increment(1.0);
        for (bound, bucket) in &child.buckets {
            if value <= *bound {
                bucket.increment(1.0);
            }
        }
    }

    fn child(&self, label_values: &[&str]) -> Arc<HistogramChild> {
        debug_assert_eq!(label_values.len(), self.label_names.len());
        self.children.get_or_insert(label_values, || {
            let labels = paired(&self.label_names, label_values);
            let key = |sample: &str| {
                MmapedValue::new(
                    MetricType::Histogram,
                    None,
                    encode_key(&self.name, sample, &labels),
                )
            };

            let sum = key(&format!("{}_sum", self.name));
            let count = key(&format!("{}_count", self.name));

            let bucket_sample = format!("{}_bucket", self.name);
            let buckets = self
                .bounds
                .iter()
                .map(|&bound| {
                    let le = bound_label(bound);
                    let mut with_le: Vec<(&str, &str)> = labels.clone();
                    with_le.push(("le", &le));
                    (
                        bound,
                        MmapedValue::new(
                            MetricType::Histogram,
                            None,
                            encode_key(&self.name, &bucket_sample, &with_le),
                        ),
                    )
                })
                .collect();

            HistogramChild { sum, count, buckets }
        })
    }
}

fn bound_label(bound: f64) -> String {
    if bound.is_infinite() {
        "+Inf".to_string()
    } else {
        format!("{bound}")
    }
}

#[derive(Debug)]
struct SummaryChild {
    sum: MmapedValue,
    count: MmapedValue,
}

/// A summary tracking only `_sum` and `_count`; quantiles are out of reach
/// without per-observation state, which the shared files do not keep.
#[derive(Debug)]
pub struct Summary {
    name: String,
    label_names: Vec<String>,
    children: Children<SummaryChild>,
}

impl Summary {
    pub fn new(name: impl Into<String>, label_names: &[&str]) -> Self {
        Summary {
            name: name.into(),
            label_names: label_names.iter().map(|n| n.to_string()).collect(),
            children: Children::default(),
        }
    }

    pub fn observe(&self, label_values: &[&str], value: f64) {
        let child = self.child(label_values);
        child.sum.increment(value);
        child.count.increment(1.0);
    }

    fn child(&self, label_values: &[&str]) -> Arc<SummaryChild> {
        debug_assert_eq!(label_values.len(), self.label_names.len());
        self.children.get_or_insert(label_values, || {
            let labels = paired(&self.label_names, label_values);
            SummaryChild {
                sum: MmapedValue::new(
                    MetricType::Summary,
                    None,
                    encode_key(&self.name, &format!("{}_sum", self.name), &labels),
                ),
                count: MmapedValue::new(
                    MetricType::Summary,
                    None,
                    encode_key(&self.name, &format!("{}_count", self.name), &labels),
                ),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_type_strings_roundtrip() {
        for t in [
            MetricType::Counter,
            MetricType::Gauge,
            MetricType::Histogram,
            MetricType::Summary,
        ] {
            assert_eq!(t.as_str().parse::<MetricType>().unwrap(), t);
        }
        assert!("exemplar".parse::<MetricType>().is_err());
    }

    #[test]
    fn mode_strings_roundtrip() {
        for m in [
            MultiprocessMode::Min,
            MultiprocessMode::Max,
            MultiprocessMode::Livesum,
            MultiprocessMode::Liveall,
            MultiprocessMode::All,
        ] {
            assert_eq!(m.as_str().parse::<MultiprocessMode>().unwrap(), m);
        }
    }

    #[test]
    fn pid_significance_follows_mode() {
        assert!(MultiprocessMode::All.pid_significant());
        assert!(MultiprocessMode::Liveall.pid_significant());
        assert!(!MultiprocessMode::Min.pid_significant());
        assert!(!MultiprocessMode::Max.pid_significant());
        assert!(!MultiprocessMode::Livesum.pid_significant());
    }

    #[test]
    fn prefixes_encode_type_and_mode() {
        assert_eq!(file_prefix(MetricType::Counter, None), "counter");
        assert_eq!(
            file_prefix(MetricType::Gauge, Some(MultiprocessMode::Livesum)),
            "gauge_livesum"
        );
        assert_eq!(
            file_prefix(MetricType::Gauge, Some(MultiprocessMode::All)),
            "gauge_all"
        );
    }

    #[test]
    fn histogram_bounds_are_sorted_with_inf_terminal() {
        let histogram = Histogram::new("h", &[], &[1.0, 0.5, 2.0]);
        assert_eq!(histogram.bounds, vec![0.5, 1.0, 2.0, f64::INFINITY]);
    }

    #[test]
    fn bound_labels_render_like_prometheus() {
        assert_eq!(bound_label(0.005), "0.005");
        assert_eq!(bound_label(1.0), "1");
        assert_eq!(bound_label(f64::INFINITY), "+Inf");
    }
}
