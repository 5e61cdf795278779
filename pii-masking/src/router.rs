use std::sync::Arc;

use async_trait::async_trait;
use common_kafka::kafka_producer::{send_messages_to_kafka, KafkaContext, OutgoingMessage};
use metrics::counter;
use rdkafka::producer::FutureProducer;
use tracing::{error, info};
use uuid::Uuid;

use crate::{
    error::DeadLetterError,
    error_record::{ErrorRecord, ErrorType},
    masking::MaskingFailure,
    metric_consts::{DEAD_LETTERS_ROUTED, DEAD_LETTER_PRODUCE_ERRORS},
    write_result::{normalize, FailedRowReport},
};

pub const ERROR_TYPE_HEADER: &str = "error_type";

/// One serialized `ErrorRecord`, ready for the dead-letter channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub error_type: ErrorType,
    pub payload: Vec<u8>,
}

impl From<&ErrorRecord> for DeadLetter {
    fn from(record: &ErrorRecord) -> Self {
        Self {
            error_type: record.error_type,
            payload: record.to_wire(),
        }
    }
}

/// Append-only channel for records that could not be masked or written.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Either every letter was accepted, or an error is returned.
    async fn send(&self, letters: Vec<DeadLetter>) -> Result<(), DeadLetterError>;
}

pub struct KafkaDeadLetterSink {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(producer: FutureProducer<KafkaContext>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(&self, letters: Vec<DeadLetter>) -> Result<(), DeadLetterError> {
        let total = letters.len();
        let messages = letters.into_iter().map(|letter| OutgoingMessage {
            key: Some(Uuid::now_v7().to_string()),
            headers: vec![(
                ERROR_TYPE_HEADER.to_string(),
                letter.error_type.as_str().to_string(),
            )],
            payload: letter.payload,
        });

        let results = send_messages_to_kafka(&self.producer, &self.topic, messages).await;

        let mut errors = results.into_iter().filter_map(Result::err);
        let Some(first) = errors.next() else {
            return Ok(());
        };
        let failed = 1 + errors.count();
        counter!(DEAD_LETTER_PRODUCE_ERRORS).increment(failed as u64);
        error!(
            "failed to produce {} of {} dead letters to {}: {}",
            failed, total, self.topic, first
        );
        Err(DeadLetterError::Produce {
            failed,
            total,
            first: first.to_string(),
        })
    }
}

/// A record that reached a failure state, from either branch of the pipeline.
#[derive(Debug)]
pub enum Failure {
    Masking(MaskingFailure),
    Write(FailedRowReport),
}

impl From<MaskingFailure> for Failure {
    fn from(failure: MaskingFailure) -> Self {
        Failure::Masking(failure)
    }
}

impl From<FailedRowReport> for Failure {
    fn from(report: FailedRowReport) -> Self {
        Failure::Write(report)
    }
}

impl Failure {
    pub fn into_error_record(self) -> ErrorRecord {
        match self {
            Failure::Masking(failure) => failure.into(),
            Failure::Write(report) => normalize(&report),
        }
    }
}

/// Fans both failure branches into the one dead-letter format.
#[derive(Clone)]
pub struct ErrorRouter {
    sink: Arc<dyn DeadLetterSink>,
}

impl ErrorRouter {
    pub fn new(sink: Arc<dyn DeadLetterSink>) -> Self {
        Self { sink }
    }

    /// Returns how many dead letters were sent.
    pub async fn route(&self, failures: Vec<Failure>) -> Result<usize, DeadLetterError> {
        if failures.is_empty() {
            return Ok(0);
        }

        let letters: Vec<DeadLetter> = failures
            .into_iter()
            .map(|failure| DeadLetter::from(&failure.into_error_record()))
            .collect();
        let count = letters.len();

        let mut masking = 0;
        for letter in &letters {
            if letter.error_type == ErrorType::MaskingError {
                masking += 1;
            }
        }

        self.sink.send(letters).await?;

        counter!(DEAD_LETTERS_ROUTED, "error_type" => ErrorType::MaskingError.as_str())
            .increment(masking);
        counter!(DEAD_LETTERS_ROUTED, "error_type" => ErrorType::SinkWriteError.as_str())
            .increment(count as u64 - masking);
        info!("routed {} records to the dead-letter channel", count);

        Ok(count)
    }
}
