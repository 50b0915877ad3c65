use std::fs::File;
use std::io::{BufWriter, Write as _};
use std::path::PathBuf;

use super::Collector;
use crate::error::CollectorError;
use crate::sample::Sample;

const DEFAULT_PATH: &str = "stampede-samples.ndjson";

/// Writes every sample as one JSON line to a file. The reference
/// implementation of the collector contract; also what `-o json=path` wires
/// up.
pub struct JsonCollector {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonCollector {
    pub fn new(path: &str) -> JsonCollector {
        let path = if path.is_empty() {
            PathBuf::from(DEFAULT_PATH)
        } else {
            PathBuf::from(path)
        };
        JsonCollector { path, writer: None }
    }
}

impl Collector for JsonCollector {
    fn init(&mut self) -> Result<(), CollectorError> {
        let file = File::create(&self.path)?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn collect(&mut self, samples: &[Sample]) -> Result<(), CollectorError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(CollectorError::Other("collector not initialized".to_string()));
        };
        for sample in samples {
            let line = serde_json::to_string(sample)
                .map_err(|e| CollectorError::Other(e.to_string()))?;
            writeln!(writer, "{line}")?;
        }
        Ok(())
    }

    fn link(&self) -> String {
        self.path.display().to_string()
    }

    fn close(&mut self) -> Result<(), CollectorError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
