pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("lua error: {0}")]
    Lua(#[from] mlua::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("script is not valid UTF-8")]
    InvalidUtf8,

    #[error("expected function `Default()` in script")]
    MissingDefault,

    #[error("`options.vus` must be a non-negative integer")]
    InvalidVus,

    #[error("`options.iterations` must be a positive integer")]
    InvalidIterations,

    #[error("`options.duration` must be a valid duration, e.g. 10s, 250ms")]
    InvalidDuration,

    #[error("`options.stages` must be an array of {{ duration, target }}")]
    InvalidStages,

    #[error("`options.thresholds` must be a table of metric -> expr | [expr, ...]")]
    InvalidThresholds,

    #[error("`options.max_redirects` must be a non-negative integer")]
    InvalidMaxRedirects,

    #[error("invalid metric name (expected non-empty string)")]
    InvalidMetricName,

    #[error("invalid metric value")]
    InvalidMetricValue,
}

mod modules;
mod options;
mod runner;
mod vu;

pub use options::parse_script_options;
pub use runner::LuaRunner;
