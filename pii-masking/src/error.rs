use thiserror::Error;

/// Raised at startup only; any of these aborts the process before a record
/// is consumed.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Env(#[from] envconfig::Error),
    #[error("required setting {0} is empty")]
    Blank(&'static str),
    #[error("{name} must be of the form database.table, got {value:?}")]
    InvalidTableLocator { name: &'static str, value: String },
    #[error("{name} is not a valid url: {source}")]
    InvalidUrl {
        name: &'static str,
        source: url::ParseError,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Failure of a single masking call, or of decoding the record around it.
#[derive(Error, Debug)]
pub enum MaskingError {
    #[error("invalid JSON record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
    // The service's own message, verbatim
    #[error("{message}")]
    Service { status: u16, message: String },
    #[error("malformed masking response: {0}")]
    MalformedResponse(String),
}

/// Building the masking client failed. Fatal for the worker pool.
#[derive(Error, Debug)]
pub enum MaskingClientError {
    #[error("failed to build masking http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("invalid masking endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

#[derive(Error, Debug, Clone)]
pub enum SinkError {
    #[error("transient sink error: {0}")]
    Transient(String),
    #[error("{0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Building the sink writer failed. Fatal at startup.
#[derive(Error, Debug)]
pub enum SinkClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build sink http client: {0}")]
    Client(#[from] reqwest::Error),
}

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("failed to produce {failed} of {total} dead letters: {first}")]
    Produce {
        failed: usize,
        total: usize,
        first: String,
    },
}

/// Conditions that stop a worker. Record-level failures never show up here,
/// they are dead-lettered.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to connect masking client: {0}")]
    MaskingClient(#[from] MaskingClientError),
    #[error("failed to create source consumer: {0}")]
    Consumer(#[from] rdkafka::error::KafkaError),
    #[error("dead letter channel unavailable: {0}")]
    DeadLetter(#[from] DeadLetterError),
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
