use std::time::Duration;

use async_trait::async_trait;
use common_kafka::kafka_consumer::{Offset, OffsetErr, RecvErr, SingleTopicConsumer};
use health::{ComponentStatus, HealthHandle};
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    app_context::AppContext,
    config::Config,
    error::WorkerError,
    format::FormatStage,
    masking::{dlp::DlpClient, MaskingService, MaskingStage, RawInput},
    metric_consts::{WORKER_OFFSET_STORE_ERRORS, WORKER_RECV_ERRORS},
    pipeline::Pipeline,
    schema::AUDIT_LOG_SCHEMA,
};

const WORKER_LIVENESS_DEADLINE: Duration = Duration::from_secs(60);
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Where a worker's batches come from.
#[async_trait]
pub trait BatchSource: Send + Sync {
    type Offset: SourceOffset;

    fn topic(&self) -> &str;

    /// Up to `max` payloads, or fewer once `wait` elapses. A receive error
    /// ends the batch early and comes back with what was received before it.
    async fn next_batch(
        &self,
        max: usize,
        wait: Duration,
    ) -> (Vec<(Vec<u8>, Self::Offset)>, Option<RecvErr>);
}

pub trait SourceOffset: Send {
    fn store(self) -> Result<(), OffsetErr>;
}

#[async_trait]
impl BatchSource for SingleTopicConsumer {
    type Offset = Offset;

    fn topic(&self) -> &str {
        SingleTopicConsumer::topic(self)
    }

    async fn next_batch(
        &self,
        max: usize,
        wait: Duration,
    ) -> (Vec<(Vec<u8>, Offset)>, Option<RecvErr>) {
        let (received, error) = self.recv_batch(max, wait).await;
        let received = received
            .into_iter()
            .map(|(message, offset)| (message.payload, offset))
            .collect();
        (received, error)
    }
}

impl SourceOffset for Offset {
    fn store(self) -> Result<(), OffsetErr> {
        Offset::store(self)
    }
}

/// One member of the pool. Owns its source consumer and its masking client
/// for its whole lifetime; both are dropped when `run` returns.
pub struct Worker<M, S = SingleTopicConsumer> {
    id: usize,
    source: S,
    pipeline: Pipeline<M>,
    liveness: HealthHandle,
    batch_size: usize,
    batch_wait: Duration,
}

impl Worker<DlpClient> {
    /// Acquires the worker's resources. Fails if the masking client can't be
    /// built or the consumer can't subscribe.
    pub fn init(id: usize, config: &Config, context: &AppContext) -> Result<Self, WorkerError> {
        let client = DlpClient::connect(&config.dlp)?;
        let consumer = SingleTopicConsumer::new(config.kafka.clone(), config.consumer.clone())?;

        let pipeline = Pipeline::new(
            MaskingStage::new(client, context.policy.clone(), context.pii_fields.clone()),
            FormatStage::new(&AUDIT_LOG_SCHEMA),
            context.sink.clone(),
            context.router.clone(),
        );
        let liveness = context
            .health_registry
            .register(format!("worker-{id}"), WORKER_LIVENESS_DEADLINE);

        Ok(Self {
            id,
            source: consumer,
            pipeline,
            liveness,
            batch_size: config.max_records_per_batch,
            batch_wait: config.batch_wait(),
        })
    }
}

impl<M: MaskingService, S: BatchSource> Worker<M, S> {
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        info!("worker {} consuming from {}", self.id, self.source.topic());

        let result = self.run_until_cancelled(&shutdown).await;
        if let Err(e) = &result {
            self.liveness.report_status(ComponentStatus::Unhealthy);
            error!("worker {} stopped: {}", self.id, e);
        }

        info!("worker {} shutting down, releasing its clients", self.id);
        result
    }

    /// Only a dead letter channel failure stops the loop. Receive errors are
    /// retried; while they persist the worker stops reporting healthy, so a
    /// consumer that never recovers is restarted by the liveness probe.
    async fn run_until_cancelled(&self, shutdown: &CancellationToken) -> Result<(), WorkerError> {
        let mut recv_errors: u32 = 0;
        loop {
            if recv_errors == 0 {
                self.liveness.report_healthy();
            }

            let (received, recv_error) = tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                batch = self.source.next_batch(self.batch_size, self.batch_wait) => batch,
            };

            if !received.is_empty() {
                let (inputs, offsets): (Vec<RawInput>, Vec<S::Offset>) = received
                    .into_iter()
                    .map(|(payload, offset)| (RawInput::Bytes(payload), offset))
                    .unzip();

                // A dead letter channel failure leaves the offsets unstored, so the
                // whole batch is redelivered after restart
                self.pipeline.process_batch(&inputs).await?;
                self.store_offsets(offsets);
            }

            match recv_error {
                Some(e) => {
                    recv_errors = recv_errors.saturating_add(1);
                    counter!(WORKER_RECV_ERRORS).increment(1);
                    warn!("worker {} failed to receive: {}", self.id, e);
                    tokio::time::sleep(RECV_ERROR_BACKOFF * recv_errors.min(10)).await;
                }
                None => recv_errors = 0,
            }
        }
    }

    // A partition revoked mid-batch can't take its offsets anymore; its new
    // owner redelivers from the last commit.
    fn store_offsets(&self, offsets: Vec<S::Offset>) {
        for offset in offsets {
            if let Err(e) = offset.store() {
                counter!(WORKER_OFFSET_STORE_ERRORS).increment(1);
                warn!("worker {} failed to store offset: {}", self.id, e);
            }
        }
    }
}

/// Initializes every worker, then spawns them. Nothing is consumed unless all
/// of them acquired their resources.
pub fn spawn_workers(
    config: &Config,
    context: &AppContext,
    shutdown: CancellationToken,
) -> Result<Vec<JoinHandle<Result<(), WorkerError>>>, WorkerError> {
    let workers = (0..config.worker_count)
        .map(|id| Worker::init(id, config, context))
        .collect::<Result<Vec<_>, _>>()?;

    info!("starting {} workers", workers.len());

    Ok(workers
        .into_iter()
        .map(|worker| tokio::spawn(worker.run(shutdown.clone())))
        .collect())
}
