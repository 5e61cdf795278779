use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use rdkafka::{
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
    ClientConfig, Message,
};
use tracing::debug;

use crate::config::{ConsumerConfig, KafkaConfig};

/// A consumer bound to one topic that hands out raw payloads. Decoding is left
/// to the caller, so that undecodable messages can be routed rather than lost.
#[derive(Clone)]
pub struct SingleTopicConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

/// One received message. A message without a payload yields an empty `payload`.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: Vec<u8>,
}

impl SingleTopicConsumer {
    pub fn new(
        common_config: KafkaConfig,
        consumer_config: ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &common_config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            // Offsets are stored by hand once a record is written or dead-lettered
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "true")
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );

        if common_config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka consumer configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;
        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: consumer_config.kafka_consumer_topic,
            }),
        })
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub async fn recv(&self) -> Result<(RawMessage, Offset), RecvErr> {
        let message = self.inner.consumer.recv().await?;

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        };

        let raw = RawMessage {
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        };

        Ok((raw, offset))
    }

    /// Receives up to `max` messages, returning early once `timeout` elapses.
    /// A kafka error ends the batch, and is returned alongside whatever was
    /// received before it.
    pub async fn recv_batch(
        &self,
        max: usize,
        timeout: Duration,
    ) -> (Vec<(RawMessage, Offset)>, Option<RecvErr>) {
        let mut received = Vec::with_capacity(max);
        let mut failure = None;

        tokio::select! {
            _ = tokio::time::sleep(timeout) => {},
            _ = async {
                while received.len() < max {
                    match self.recv().await {
                        Ok(message) => received.push(message),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
            } => {}
        }

        (received, failure)
    }
}

pub struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Offset {
    /// Marks the message as consumed. The stored position is the next offset
    /// to read, which is what the group commit expects.
    pub fn store(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset + 1)?;
        Ok(())
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{{ partition: {}, offset: {} }}",
            self.partition, self.offset
        )
    }
}
