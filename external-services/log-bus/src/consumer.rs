// Consume loop, acknowledgement token and handler seam
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::DecodeFailurePolicy;
use crate::record::LogRecord;
use crate::transport::{DeliveryAcker, DeliveryStream};

/// Settles one delivery. Consumed by use, so a message can be settled at most
/// once; dropping it unused logs a warning and leaves the message
/// unacknowledged until the consumer disconnects.
pub struct Acknowledgement {
    acker: Option<Arc<dyn DeliveryAcker>>,
    delivery_tag: u64,
    redelivered: bool,
    kind: &'static str,
}

impl Acknowledgement {
    fn new(acker: Arc<dyn DeliveryAcker>, delivery_tag: u64, redelivered: bool, kind: &'static str) -> Self {
        Self {
            acker: Some(acker),
            delivery_tag,
            redelivered,
            kind,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker has handed this message out before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// `true` removes the message from the queue; `false` requeues it.
    pub async fn settle(mut self, accepted: bool) {
        let Some(acker) = self.acker.take() else {
            return;
        };

        if accepted {
            if let Err(e) = acker.ack().await {
                error!(
                    kind = self.kind,
                    delivery_tag = self.delivery_tag,
                    error = %e,
                    "Failed to acknowledge message"
                );
            }
        } else if let Err(e) = acker.nack(true).await {
            error!(
                kind = self.kind,
                delivery_tag = self.delivery_tag,
                error = %e,
                "Failed to nack message"
            );
        }
    }

    pub async fn ack(self) {
        self.settle(true).await;
    }

    pub async fn nack(self) {
        self.settle(false).await;
    }
}

impl std::fmt::Debug for Acknowledgement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Acknowledgement")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

impl Drop for Acknowledgement {
    fn drop(&mut self) {
        if self.acker.is_some() {
            warn!(
                kind = self.kind,
                delivery_tag = self.delivery_tag,
                "Acknowledgement dropped without ack or nack; message stays unacknowledged"
            );
        }
    }
}

/// Receives each decoded record together with its acknowledgement token.
/// The loop waits for `handle` to return before taking the next delivery.
#[async_trait]
pub trait LogHandler<R: LogRecord>: Send + Sync + 'static {
    async fn handle(&self, record: R, ack: Acknowledgement);
}

#[async_trait]
impl<R, F, Fut> LogHandler<R> for F
where
    R: LogRecord,
    F: Fn(R, Acknowledgement) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, record: R, ack: Acknowledgement) {
        (self)(record, ack).await;
    }
}

/// A running consume loop. Awaiting [`ConsumerHandle::closed`] resolves once
/// the delivery stream ends, which happens when the client is closed.
#[derive(Debug)]
pub struct ConsumerHandle {
    consumer_tag: String,
    queue: &'static str,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }

    pub fn queue(&self) -> &'static str {
        self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn closed(self) {
        if let Err(e) = self.task.await {
            error!(consumer = %self.consumer_tag, error = %e, "Consumer task ended abnormally");
        }
    }
}

pub(crate) fn spawn_consume_loop<R, H>(
    deliveries: DeliveryStream,
    handler: H,
    on_decode_failure: DecodeFailurePolicy,
    consumer_tag: String,
) -> ConsumerHandle
where
    R: LogRecord,
    H: LogHandler<R>,
{
    let tag = consumer_tag.clone();
    let task = tokio::spawn(run_consume_loop::<R, H>(
        deliveries,
        handler,
        on_decode_failure,
        tag,
    ));

    ConsumerHandle {
        consumer_tag,
        queue: R::TOPIC,
        task,
    }
}

async fn run_consume_loop<R, H>(
    mut deliveries: DeliveryStream,
    handler: H,
    on_decode_failure: DecodeFailurePolicy,
    consumer_tag: String,
) where
    R: LogRecord,
    H: LogHandler<R>,
{
    while let Some(next) = deliveries.next().await {
        let delivery = match next {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(kind = R::KIND, consumer = %consumer_tag, error = %e, "Delivery stream error");
                continue;
            }
        };

        let record = match serde_json::from_slice::<R>(&delivery.body) {
            Ok(record) => record,
            Err(e) => {
                warn!(
                    kind = R::KIND,
                    consumer = %consumer_tag,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Error unmarshaling message"
                );
                if on_decode_failure == DecodeFailurePolicy::Reject {
                    if let Err(e) = delivery.acker.reject(false).await {
                        error!(
                            kind = R::KIND,
                            delivery_tag = delivery.delivery_tag,
                            error = %e,
                            "Failed to reject undecodable message"
                        );
                    }
                }
                continue;
            }
        };

        debug!(
            kind = R::KIND,
            consumer = %consumer_tag,
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "Dispatching message to handler"
        );
        let ack = Acknowledgement::new(
            delivery.acker,
            delivery.delivery_tag,
            delivery.redelivered,
            R::KIND,
        );
        handler.handle(record, ack).await;
    }

    info!(kind = R::KIND, consumer = %consumer_tag, "Delivery stream closed, consumer stopped");
}
