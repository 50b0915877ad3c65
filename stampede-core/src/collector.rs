pub mod json;

use std::fmt;

use crate::error::{CollectorError, ConfigError};
use crate::sample::Sample;

/// External sink for samples. The engine serializes all calls: `init` once
/// before the first sample, `collect` for each flushed batch, `close` once
/// at the end. Implementations own their batching and backpressure.
/// Collector failures are logged by the engine, never fatal.
pub trait Collector: Send {
    fn init(&mut self) -> Result<(), CollectorError>;

    fn collect(&mut self, samples: &[Sample]) -> Result<(), CollectorError>;

    /// A human-displayable URL for the run, or empty.
    fn link(&self) -> String {
        String::new()
    }

    fn close(&mut self) -> Result<(), CollectorError>;
}

impl fmt::Debug for dyn Collector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Collector")
    }
}

/// Splits a collector descriptor `type=arg` (the arg is optional).
pub fn parse_descriptor(descriptor: &str) -> (&str, &str) {
    match descriptor.split_once('=') {
        Some((t, arg)) => (t, arg),
        None => (descriptor, ""),
    }
}

/// Builds the collector named by an `--out` descriptor.
pub fn from_descriptor(descriptor: &str) -> Result<Box<dyn Collector>, ConfigError> {
    let (collector_type, arg) = parse_descriptor(descriptor);
    match collector_type {
        "json" => Ok(Box::new(json::JsonCollector::new(arg))),
        other => Err(ConfigError::UnknownCollector(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_splits_type_and_arg() {
        assert_eq!(parse_descriptor("json=out.ndjson"), ("json", "out.ndjson"));
        assert_eq!(parse_descriptor("json"), ("json", ""));
        assert_eq!(
            parse_descriptor("influxdb=http://localhost:8086/db"),
            ("influxdb", "http://localhost:8086/db")
        );
    }

    #[test]
    fn unknown_collector_type_is_rejected() {
        let err = from_descriptor("carrier-pigeon=coop").expect_err("expected config error");
        assert!(matches!(err, ConfigError::UnknownCollector(t) if t == "carrier-pigeon"));
    }
}
