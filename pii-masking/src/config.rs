use std::time::Duration;

use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;
use url::Url;

use crate::{error::ConfigError, sink::TableLocator};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Serves _liveness, _readiness and metrics
    #[envconfig(from = "BIND_HOST", default = "::")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    pub dead_letter_topic: String,

    #[envconfig(nested = true)]
    pub dlp: DlpConfig,

    #[envconfig(nested = true)]
    pub sink: SinkConfig,

    // Comma separated
    #[envconfig(default = "userIamPrincipal")]
    pub pii_fields: String,

    #[envconfig(default = "4")]
    pub worker_count: usize,

    #[envconfig(default = "500")]
    pub max_records_per_batch: usize,

    #[envconfig(default = "1000")]
    pub max_record_batch_wait_ms: u64,
}

#[derive(Envconfig, Clone, Debug)]
pub struct DlpConfig {
    #[envconfig(from = "DLP_PROJECT")]
    pub project: String,

    #[envconfig(from = "DLP_ENDPOINT", default = "https://dlp.googleapis.com")]
    pub endpoint: String,

    #[envconfig(from = "DLP_ACCESS_TOKEN")]
    pub access_token: Option<String>,

    #[envconfig(from = "DLP_TIMEOUT_MS", default = "10000")]
    pub timeout_ms: u64,

    // Pre-registered policies, used instead of the inline defaults when set
    #[envconfig(from = "DEIDENTIFY_TEMPLATE")]
    pub deidentify_template: Option<String>,

    #[envconfig(from = "INSPECT_TEMPLATE")]
    pub inspect_template: Option<String>,
}

#[derive(Envconfig, Clone, Debug)]
pub struct SinkConfig {
    // database.table
    #[envconfig(from = "OUTPUT_TABLE")]
    pub output_table: String,

    #[envconfig(from = "CLICKHOUSE_URL", default = "http://localhost:8123")]
    pub clickhouse_url: String,

    #[envconfig(from = "CLICKHOUSE_USER", default = "default")]
    pub clickhouse_user: String,

    #[envconfig(from = "CLICKHOUSE_PASSWORD", default = "")]
    pub clickhouse_password: String,

    // Per request; a request that runs out of time is retried like any other transient failure
    #[envconfig(from = "SINK_TIMEOUT_MS", default = "10000")]
    pub timeout_ms: u64,

    #[envconfig(from = "SINK_MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,

    #[envconfig(from = "SINK_RETRY_INITIAL_INTERVAL_MS", default = "500")]
    pub retry_initial_interval_ms: u64,

    #[envconfig(from = "SINK_RETRY_MAX_INTERVAL_MS", default = "10000")]
    pub retry_max_interval_ms: u64,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, ConfigError> {
        // Offsets are stored by hand, so every worker of a deployment can share one group
        ConsumerConfig::set_defaults("pii-masking");

        let config = Self::init_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Presence checks for the locators handed to the collaborators. Nothing
    /// here talks to the network.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require("KAFKA_CONSUMER_TOPIC", &self.consumer.kafka_consumer_topic)?;
        require("DEAD_LETTER_TOPIC", &self.dead_letter_topic)?;
        require("DLP_PROJECT", &self.dlp.project)?;
        require("OUTPUT_TABLE", &self.sink.output_table)?;

        self.sink.table()?;
        self.dlp.endpoint_url()?;
        self.sink.clickhouse_url()?;

        if self.worker_count == 0 {
            return Err(ConfigError::Zero("WORKER_COUNT"));
        }
        if self.max_records_per_batch == 0 {
            return Err(ConfigError::Zero("MAX_RECORDS_PER_BATCH"));
        }
        if self.sink.timeout_ms == 0 {
            return Err(ConfigError::Zero("SINK_TIMEOUT_MS"));
        }
        if self.sink.max_attempts == 0 {
            return Err(ConfigError::Zero("SINK_MAX_ATTEMPTS"));
        }
        if self.pii_fields().is_empty() {
            return Err(ConfigError::Blank("PII_FIELDS"));
        }
        Ok(())
    }

    pub fn pii_fields(&self) -> Vec<String> {
        self.pii_fields
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_record_batch_wait_ms)
    }
}

impl DlpConfig {
    pub fn endpoint_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.endpoint).map_err(|source| ConfigError::InvalidUrl {
            name: "DLP_ENDPOINT",
            source,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SinkConfig {
    pub fn table(&self) -> Result<TableLocator, ConfigError> {
        self.output_table
            .parse()
            .map_err(|_| ConfigError::InvalidTableLocator {
                name: "OUTPUT_TABLE",
                value: self.output_table.clone(),
            })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn clickhouse_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.clickhouse_url).map_err(|source| ConfigError::InvalidUrl {
            name: "CLICKHOUSE_URL",
            source,
        })
    }
}

fn require(name: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Blank(name));
    }
    Ok(())
}
