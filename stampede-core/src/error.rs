pub type Result<T> = std::result::Result<T, Error>;

/// Errors that stop a run before it starts, plus the per-iteration and
/// collector failures that are reported but never abort the test.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("load error: {0}")]
    Load(#[from] LoadError),

    #[error("compile error: {0}")]
    Compile(String),

    #[error("runtime error: {0}")]
    Runtime(String),

    #[error("collector error: {0}")]
    Collector(#[from] CollectorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    /// Tag value for `errors{kind=...}` samples.
    pub fn kind_label(&self) -> &'static str {
        match self {
            Error::Config(_) => "config",
            Error::Load(_) => "load",
            Error::Compile(_) => "compile",
            Error::Runtime(_) => "script",
            Error::Collector(_) => "collector",
            Error::Io(_) => "io",
            Error::Join(_) => "engine",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`iterations` must be a positive integer")]
    InvalidIterations,

    #[error("`vus` ({vus}) may not exceed `vus-max` ({vus_max})")]
    VusExceedMax { vus: u64, vus_max: u64 },

    #[error("`stages` must have a non-zero total duration")]
    InvalidStages,

    #[error("invalid threshold for `{metric}`: {reason}")]
    InvalidThreshold { metric: String, reason: String },

    #[error("unknown collector type `{0}`")]
    UnknownCollector(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no file or importable reference found at `{0}`")]
    NotFound(String),

    #[error("failed to read `{reference}`: {source}")]
    Io {
        reference: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fetch `{reference}`: {reason}")]
    Remote { reference: String, reason: String },

    #[error("malformed archive: {0}")]
    Archive(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}
