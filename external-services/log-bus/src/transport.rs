// Broker transport seam (AMQP in production, in-memory for tests)
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error(transparent)]
    Amqp(#[from] lapin::Error),

    #[error("{0}")]
    Broker(String),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Flags for a queue declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Survives broker restarts, shared by all connections, kept when unused.
    pub const fn durable_shared() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

/// Stream of deliveries for one subscription. Ends when the channel or
/// connection it was registered on goes away.
pub type DeliveryStream = BoxStream<'static, TransportResult<Delivery>>;

/// One message handed to a consumer, still owned by the broker until it is
/// settled through its acker.
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

/// Settles a single delivery.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> TransportResult<()>;

    async fn nack(&self, requeue: bool) -> TransportResult<()>;

    async fn reject(&self, requeue: bool) -> TransportResult<()>;
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(
        &self,
        uri: &str,
        connection_name: Option<&str>,
    ) -> TransportResult<Box<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn open_channel(&self) -> TransportResult<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> TransportResult<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> TransportResult<()>;

    /// Publish on the default exchange, non-mandatory and non-immediate.
    async fn publish(&self, routing_key: &str, payload: &[u8], content_type: &str)
        -> TransportResult<()>;

    /// Per-consumer prefetch for consumers registered afterwards on this channel.
    async fn set_prefetch(&self, prefetch_count: u16) -> TransportResult<()>;

    /// Register a manual-ack, non-exclusive consumer.
    async fn subscribe(&self, queue: &str, consumer_tag: &str) -> TransportResult<DeliveryStream>;

    async fn close(&self) -> TransportResult<()>;
}
