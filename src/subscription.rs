//! Bridges error-queue deliveries into the dispatcher.

use crate::config::RetryConfig;
use crate::dispatcher::{Completion, Dispatcher};
use crate::envelope::{ErrorEnvelope, WorkItem};
use crate::error::{PipelineFault, RetryError};
use crate::handler::EnvelopeHandler;
use crate::republish::RepublishOutcome;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    types::FieldTable,
    Connection, Consumer,
};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};

/// Acknowledges a delivery back to the broker.
#[async_trait]
pub trait Acknowledge: Send + Sync {
    async fn ack(&self) -> Result<(), RetryError>;

    /// Negatively acknowledges; with `requeue` the broker keeps the message.
    async fn reject(&self, requeue: bool) -> Result<(), RetryError>;
}

/// One message taken from the error queue.
pub struct InboundDelivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub acker: Box<dyn Acknowledge>,
}

/// Yields deliveries from the error queue until the subscription ends.
#[async_trait]
pub trait DeliverySource: Send {
    async fn next_delivery(&mut self) -> Option<Result<InboundDelivery, RetryError>>;
}

struct LapinAcker(Acker);

#[async_trait]
impl Acknowledge for LapinAcker {
    async fn ack(&self) -> Result<(), RetryError> {
        self.0.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), RetryError> {
        self.0.nack(BasicNackOptions { requeue, ..Default::default() }).await?;
        Ok(())
    }
}

impl From<Delivery> for InboundDelivery {
    fn from(delivery: Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            payload: delivery.data,
            acker: Box::new(LapinAcker(delivery.acker)),
        }
    }
}

#[async_trait]
impl DeliverySource for Consumer {
    async fn next_delivery(&mut self) -> Option<Result<InboundDelivery, RetryError>> {
        let delivery = self.next().await?;
        Some(delivery.map(InboundDelivery::from).map_err(RetryError::from))
    }
}

/// Opens a channel on `connection`, applies the prefetch and starts consuming the
/// error queue. The queue is expected to exist already.
pub async fn subscribe_error_queue(connection: &Connection, config: &RetryConfig) -> Result<Consumer, RetryError> {
    let channel = connection.create_channel().await?;
    channel.basic_qos(config.prefetch_count, BasicQosOptions::default()).await?;
    log::info!("QoS prefetch count set to {}", config.prefetch_count);

    let consumer = channel
        .basic_consume(
            &config.error_queue,
            &config.consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    log::info!(
        "Consumer started with tag '{}' on '{}'. Waiting for error messages...",
        consumer.tag().as_str(),
        config.error_queue
    );
    Ok(consumer)
}

/// Per-outcome counts for one subscription run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionReport {
    pub published: usize,
    pub destination_missing: usize,
    pub transport_failures: usize,
    pub peak_concurrency: usize,
    /// Most acknowledgement tasks waiting on their work item at once.
    pub peak_pending_acks: usize,
}

#[derive(Default)]
struct Tally {
    published: AtomicUsize,
    destination_missing: AtomicUsize,
    transport_failures: AtomicUsize,
}

impl Tally {
    fn record(&self, outcome: &RepublishOutcome) {
        let counter = match outcome {
            RepublishOutcome::Published => &self.published,
            RepublishOutcome::DestinationMissing(_) => &self.destination_missing,
            RepublishOutcome::TransportFailure(_) => &self.transport_failures,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn report(&self, peak_concurrency: usize, peak_pending_acks: usize) -> SubscriptionReport {
        SubscriptionReport {
            published: self.published.load(Ordering::SeqCst),
            destination_missing: self.destination_missing.load(Ordering::SeqCst),
            transport_failures: self.transport_failures.load(Ordering::SeqCst),
            peak_concurrency,
            peak_pending_acks,
        }
    }
}

/// Drains a [`DeliverySource`] through a [`Dispatcher`], acknowledging each
/// delivery once its work item resolves.
pub struct SubscriptionAdapter<H: EnvelopeHandler> {
    handler: Arc<H>,
    dispatcher: Dispatcher,
}

impl<H: EnvelopeHandler + 'static> SubscriptionAdapter<H> {
    pub fn new(handler: Arc<H>, dispatcher: Dispatcher) -> Self {
        Self { handler, dispatcher }
    }

    /// Runs until the source is exhausted or the pipeline faults.
    pub async fn run<S: DeliverySource>(self, source: S) -> Result<SubscriptionReport, RetryError> {
        self.run_until(source, std::future::pending::<()>()).await
    }

    /// Runs until the source is exhausted, `shutdown` resolves, or the pipeline
    /// faults. Intake stops at once; in-flight work drains and is acknowledged
    /// before the dispatcher is released.
    ///
    /// A pipeline fault is returned as [`RetryError::Pipeline`].
    pub async fn run_until<S, F>(self, mut source: S, shutdown: F) -> Result<SubscriptionReport, RetryError>
    where
        S: DeliverySource,
        F: Future<Output = ()>,
    {
        let Self { handler, dispatcher } = self;
        let tally = Arc::new(Tally::default());
        let mut pending = JoinSet::new();
        let mut faults = dispatcher.faults();
        let mut intake_fault: Option<PipelineFault> = None;
        let mut source_error: Option<RetryError> = None;
        let mut peak_pending_acks = 0;
        tokio::pin!(shutdown);

        log::info!(
            "Retry started with handler '{}'. Listening for error messages.",
            handler.handler_name()
        );

        loop {
            tokio::select! {
                biased;
                _ = faults.changed() => {
                    if faults.borrow().is_some() {
                        break;
                    }
                }
                _ = &mut shutdown => {
                    log::info!("Shutdown requested. No further error messages will be taken.");
                    break;
                }
                Some(joined) = pending.join_next(), if !pending.is_empty() => {
                    log_ack_task_failure(joined);
                }
                next = source.next_delivery() => match next {
                    None => {
                        log::info!("Error queue subscription ended.");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("Error queue subscription failed: {}", e);
                        source_error = Some(e);
                        break;
                    }
                    Some(Ok(delivery)) => {
                        let dispatched = Self::dispatch(&handler, &dispatcher, &tally, &mut pending, delivery).await;
                        peak_pending_acks = peak_pending_acks.max(pending.len());
                        if let Err(fault) = dispatched {
                            intake_fault = Some(fault);
                            break;
                        }
                    }
                },
            }
        }

        while let Some(joined) = pending.join_next().await {
            log_ack_task_failure(joined);
        }

        let peak_concurrency = dispatcher.peak_concurrency();
        let fault = dispatcher.fault().or(intake_fault);
        dispatcher.shutdown().await?;

        if let Some(e) = source_error {
            return Err(e);
        }
        if let Some(fault) = fault {
            log::error!("Retry pipeline stopped by a fault after {:?}", tally.report(peak_concurrency, peak_pending_acks));
            return Err(RetryError::Pipeline(fault));
        }

        let report = tally.report(peak_concurrency, peak_pending_acks);
        log::info!("Retry pipeline finished: {:?}", report);
        Ok(report)
    }

    /// Submits one delivery. Returns the fault that should stop intake, if any.
    async fn dispatch(
        handler: &Arc<H>,
        dispatcher: &Dispatcher,
        tally: &Arc<Tally>,
        pending: &mut JoinSet<()>,
        delivery: InboundDelivery,
    ) -> Result<(), PipelineFault> {
        let InboundDelivery { delivery_tag, payload, acker } = delivery;

        let envelope = match ErrorEnvelope::from_slice(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                log::error!("Delivery {} is not an error envelope, returning it to the queue: {}", delivery_tag, e);
                reject(acker.as_ref(), delivery_tag).await;
                return Err(PipelineFault::new(format!("delivery-{}", delivery_tag), e.to_string()));
            }
        };

        let work_item = WorkItem::new(envelope);
        let handler = Arc::clone(handler);
        let submitted: Result<Completion<RepublishOutcome>, RetryError> = dispatcher.submit(move |ctx| async move {
            let waited = Utc::now() - work_item.submitted_at;
            log::debug!(
                "[ContextId={}] Delivery {} started after {} ms in queue",
                ctx.correlation_id(),
                delivery_tag,
                waited.num_milliseconds()
            );
            handler.handle_envelope(&ctx, work_item.envelope).await
        });

        let completion = match submitted {
            Ok(completion) => completion,
            Err(e) => {
                log::warn!("Delivery {} not dispatched: {}", delivery_tag, e);
                reject(acker.as_ref(), delivery_tag).await;
                return Err(dispatcher
                    .fault()
                    .unwrap_or_else(|| PipelineFault::new(format!("delivery-{}", delivery_tag), e.to_string())));
            }
        };

        let tally = Arc::clone(tally);
        pending.spawn(async move {
            match completion.await {
                Ok(outcome) => {
                    tally.record(&outcome);
                    if let Err(e) = acker.ack().await {
                        log::error!("Failed to ack delivery {}: {}", delivery_tag, e);
                    }
                }
                Err(fault) => {
                    log::error!("Delivery {} faulted the pipeline: {}", delivery_tag, fault);
                    reject(acker.as_ref(), delivery_tag).await;
                }
            }
        });
        Ok(())
    }
}

fn log_ack_task_failure(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        log::error!("Acknowledgement task failed: {}", e);
    }
}

async fn reject(acker: &dyn Acknowledge, delivery_tag: u64) {
    if let Err(e) = acker.reject(true).await {
        log::error!("Failed to return delivery {} to the error queue: {}", delivery_tag, e);
    }
}
