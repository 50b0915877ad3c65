mod key;
mod metrics;
mod registry;
mod tags;

pub use key::{Interner, KeyId};
pub use metrics::{
    MetricHandle, MetricKind, MetricSeriesSummary, MetricStorage, MetricValue, TrendSummary,
};
pub use registry::{MetricId, Registry};
pub use tags::TagSet;
