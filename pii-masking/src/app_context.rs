use std::{sync::Arc, time::Duration};

use anyhow::Context;
use common_kafka::kafka_producer::create_kafka_producer;
use health::HealthRegistry;
use tracing::info;

use crate::{
    config::Config,
    masking::MaskingPolicy,
    router::{ErrorRouter, KafkaDeadLetterSink},
    schema::AUDIT_LOG_SCHEMA,
    sink::{clickhouse::ClickHouseSink, RowSink},
};

/// Process-wide collaborators, shared by every worker. Per-worker resources
/// (source consumer, masking client) are created by the workers themselves.
pub struct AppContext {
    pub health_registry: HealthRegistry,
    pub sink: Arc<dyn RowSink>,
    pub router: ErrorRouter,
    pub policy: MaskingPolicy,
    pub pii_fields: Vec<String>,
}

impl AppContext {
    pub async fn new(config: &Config) -> Result<Self, anyhow::Error> {
        let health_registry = HealthRegistry::new("liveness");
        let kafka_liveness = health_registry.register("rdkafka", Duration::from_secs(30));

        let producer = create_kafka_producer(&config.kafka, kafka_liveness)
            .await
            .context("failed to create dead letter producer")?;
        let router = ErrorRouter::new(Arc::new(KafkaDeadLetterSink::new(
            producer,
            config.dead_letter_topic.clone(),
        )));

        let sink = ClickHouseSink::new(&config.sink, &AUDIT_LOG_SCHEMA)
            .context("failed to create sink writer")?;
        sink.ensure_table()
            .await
            .with_context(|| format!("failed to provision output table {}", sink.table()))?;

        let policy = MaskingPolicy::from_templates(
            config.dlp.deidentify_template.clone(),
            config.dlp.inspect_template.clone(),
        );
        info!(
            "masking fields {:?} of records from {} into {}, dead letters to {}",
            config.pii_fields(),
            config.consumer.kafka_consumer_topic,
            sink.table(),
            config.dead_letter_topic
        );

        Ok(Self {
            health_registry,
            sink: Arc::new(sink),
            router,
            policy,
            pii_fields: config.pii_fields(),
        })
    }
}
