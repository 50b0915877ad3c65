use std::time::SystemTime;

use serde::Serialize;
use stampede_metrics::MetricKind;
use tokio::sync::mpsc;

/// Built-in metric names emitted by the engine, executor and script runtime.
pub mod builtin {
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const DROPPED_ITERATIONS: &str = "dropped_iterations";
    pub const ERRORS: &str = "errors";
    pub const CHECKS: &str = "checks";
    pub const VUS: &str = "vus";
    pub const VUS_MAX: &str = "vus_max";
    pub const DATA_SENT: &str = "data_sent";
    pub const DATA_RECEIVED: &str = "data_received";
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_FAILED: &str = "http_req_failed";
}

/// A single metric event. Timestamps are monotonically non-decreasing per
/// emitting VU, not globally.
#[derive(Debug, Clone, Serialize)]
pub struct Sample {
    pub metric: String,
    pub kind: MetricKind,
    #[serde(with = "unix_millis")]
    pub time: SystemTime,
    pub value: f64,
    pub tags: Vec<(String, String)>,
}

impl Sample {
    pub fn now(metric: &str, kind: MetricKind, value: f64) -> Sample {
        Sample {
            metric: metric.to_string(),
            kind,
            time: SystemTime::now(),
            value,
            tags: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_tag(mut self, key: &str, value: &str) -> Sample {
        self.tags.push((key.to_string(), value.to_string()));
        self
    }
}

/// Cloneable sample producer handed to every VU at mint time. Emission never
/// blocks; the engine owns the consuming end.
#[derive(Debug, Clone)]
pub struct SampleSink {
    tx: mpsc::UnboundedSender<Sample>,
}

impl SampleSink {
    pub fn channel() -> (SampleSink, mpsc::UnboundedReceiver<Sample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SampleSink { tx }, rx)
    }

    pub fn emit(&self, sample: Sample) {
        // The receiver only disappears at engine teardown; late samples are
        // dropped by design.
        let _ = self.tx.send(sample);
    }
}

mod unix_millis {
    use serde::Serializer;
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let millis = t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        s.serialize_u64(millis)
    }
}
