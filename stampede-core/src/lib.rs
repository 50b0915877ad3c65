pub mod archive;
pub mod collector;
pub mod engine;
pub mod error;
pub mod executor;
pub mod group;
pub mod http;
pub mod loader;
pub mod options;
pub mod runner;
pub mod sample;
pub mod schedule;
pub mod shutdown;
pub mod thresholds;

pub use archive::{Archive, looks_like_archive};
pub use collector::Collector;
pub use engine::{Engine, ThresholdStatus};
pub use error::{CollectorError, ConfigError, Error, LoadError, Result};
pub use executor::{Executor, GRACE_PERIOD, Phase};
pub use group::{Check, CheckSnapshot, Group, GroupSnapshot};
pub use http::{HttpClient, HttpConfig, HttpRequest, HttpResponse};
pub use loader::{SourceData, read_source};
pub use options::{Options, Stage};
pub use runner::{Runner, Vu};
pub use sample::{Sample, SampleSink, builtin};
pub use schedule::StageSchedule;
pub use shutdown::Shutdown;
pub use thresholds::Threshold;
