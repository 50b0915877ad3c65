use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trend values are recorded with three decimal places of precision.
const TREND_SCALE: f64 = 1_000.0;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, Serialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    Counter,
    Gauge,
    Rate,
    Trend,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSeriesSummary {
    pub name: String,
    pub kind: MetricKind,
    pub tags: Vec<(String, String)>,
    pub values: MetricValue,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MetricValue {
    Counter {
        count: u64,
    },
    Gauge {
        value: f64,
    },
    Rate {
        total: u64,
        hits: u64,
        rate: Option<f64>,
    },
    Trend(TrendSummary),
}

#[derive(Debug, Clone, Serialize)]
pub struct TrendSummary {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub count: u64,
}

fn new_trend_histogram() -> Histogram<u64> {
    // Upper bound fits one hour in milliseconds at trend precision.
    match Histogram::<u64>::new_with_bounds(1, 60 * 60 * 1_000 * TREND_SCALE as u64, 3) {
        Ok(h) => h,
        Err(err) => panic!("failed to create trend histogram: {err}"),
    }
}

fn summarize_trend(h: &Histogram<u64>) -> TrendSummary {
    let count = h.len();
    let scaled = |v: u64| v as f64 / TREND_SCALE;

    TrendSummary {
        min: (count > 0).then(|| scaled(h.min())),
        max: (count > 0).then(|| scaled(h.max())),
        avg: (count > 0).then(|| h.mean() / TREND_SCALE),
        p50: (count > 0).then(|| scaled(h.value_at_quantile(0.50))),
        p90: (count > 0).then(|| scaled(h.value_at_quantile(0.90))),
        p95: (count > 0).then(|| scaled(h.value_at_quantile(0.95))),
        p99: (count > 0).then(|| scaled(h.value_at_quantile(0.99))),
        count,
    }
}

#[derive(Debug)]
pub enum MetricStorage {
    Counter(Arc<AtomicU64>),
    // f64 bits; gauges keep the last written sample value.
    Gauge(Arc<AtomicU64>),
    Rate(Arc<RateCounters>),
    Trend(Arc<Mutex<Histogram<u64>>>),
}

#[derive(Debug, Default)]
pub struct RateCounters {
    pub total: AtomicU64,
    pub hits: AtomicU64,
}

impl MetricStorage {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Counter => MetricStorage::Counter(Arc::new(AtomicU64::new(0))),
            MetricKind::Gauge => {
                MetricStorage::Gauge(Arc::new(AtomicU64::new(0f64.to_bits())))
            }
            MetricKind::Rate => MetricStorage::Rate(Arc::new(RateCounters::default())),
            MetricKind::Trend => {
                MetricStorage::Trend(Arc::new(Mutex::new(new_trend_histogram())))
            }
        }
    }

    pub fn handle(&self) -> MetricHandle {
        match self {
            MetricStorage::Counter(a) => MetricHandle::Counter(a.clone()),
            MetricStorage::Gauge(a) => MetricHandle::Gauge(a.clone()),
            MetricStorage::Rate(r) => MetricHandle::Rate(r.clone()),
            MetricStorage::Trend(h) => MetricHandle::Trend(h.clone()),
        }
    }

    pub fn value(&self) -> MetricValue {
        match self {
            MetricStorage::Counter(a) => MetricValue::Counter {
                count: a.load(Ordering::Relaxed),
            },
            MetricStorage::Gauge(a) => MetricValue::Gauge {
                value: f64::from_bits(a.load(Ordering::Relaxed)),
            },
            MetricStorage::Rate(r) => {
                let total = r.total.load(Ordering::Relaxed);
                let hits = r.hits.load(Ordering::Relaxed);
                let rate = (total > 0).then(|| hits as f64 / total as f64);
                MetricValue::Rate { total, hits, rate }
            }
            MetricStorage::Trend(h) => MetricValue::Trend(summarize_trend(&h.lock())),
        }
    }
}

/// Cloneable write handle for one metric series.
#[derive(Debug, Clone)]
pub enum MetricHandle {
    Counter(Arc<AtomicU64>),
    Gauge(Arc<AtomicU64>),
    Rate(Arc<RateCounters>),
    Trend(Arc<Mutex<Histogram<u64>>>),
}

impl MetricHandle {
    /// Folds one sample value into the sink. Counters add, gauges keep the
    /// last value, rates count non-zero values as hits, trends record into
    /// the histogram at fixed-point precision.
    #[inline]
    pub fn record(&self, value: f64) {
        match self {
            MetricHandle::Counter(c) => {
                c.fetch_add(value.max(0.0).round() as u64, Ordering::Relaxed);
            }
            MetricHandle::Gauge(g) => {
                g.store(value.to_bits(), Ordering::Relaxed);
            }
            MetricHandle::Rate(r) => {
                r.total.fetch_add(1, Ordering::Relaxed);
                if value != 0.0 {
                    r.hits.fetch_add(1, Ordering::Relaxed);
                }
            }
            MetricHandle::Trend(h) => {
                let scaled = (value.max(0.0) * TREND_SCALE).round() as u64;
                let _ = h.lock().record(scaled.max(1));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_adds_sample_values() {
        let storage = MetricStorage::new(MetricKind::Counter);
        let handle = storage.handle();
        handle.record(1.0);
        handle.record(41.0);
        match storage.value() {
            MetricValue::Counter { count } => assert_eq!(count, 42),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn gauge_keeps_last_value() {
        let storage = MetricStorage::new(MetricKind::Gauge);
        let handle = storage.handle();
        handle.record(5.0);
        handle.record(2.5);
        match storage.value() {
            MetricValue::Gauge { value } => assert_eq!(value, 2.5),
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn rate_counts_nonzero_hits() {
        let storage = MetricStorage::new(MetricKind::Rate);
        let handle = storage.handle();
        handle.record(1.0);
        handle.record(0.0);
        handle.record(1.0);
        handle.record(1.0);
        match storage.value() {
            MetricValue::Rate { total, hits, rate } => {
                assert_eq!(total, 4);
                assert_eq!(hits, 3);
                assert_eq!(rate, Some(0.75));
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }

    #[test]
    fn trend_preserves_fractions() {
        let storage = MetricStorage::new(MetricKind::Trend);
        let handle = storage.handle();
        handle.record(1.5);
        handle.record(2.5);
        match storage.value() {
            MetricValue::Trend(t) => {
                assert_eq!(t.count, 2);
                let min = t.min.unwrap_or(0.0);
                let max = t.max.unwrap_or(0.0);
                assert!((min - 1.5).abs() < 0.01, "min = {min}");
                assert!((max - 2.5).abs() < 0.01, "max = {max}");
            }
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
