// Connection handle, queue provisioning and publishing
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::amqp::AmqpTransport;
use crate::config::{BrokerConfig, ConsumeOptions};
use crate::consumer::{spawn_consume_loop, ConsumerHandle, LogHandler};
use crate::error::{LogBusError, Result};
use crate::record::{ActivityLog, AuditLog, LogRecord, ACTIVITY_TOPIC_NAME, AUDIT_TOPIC_NAME};
use crate::transport::{BrokerChannel, BrokerConnection, BrokerTransport, QueueOptions};

const JSON_CONTENT_TYPE: &str = "application/json";

/// One broker connection and channel with one declared log queue.
///
/// Cloning shares the same connection. Every handle returned by
/// [`LogClient::initialize`] is independent, so two initialize calls for the
/// same topic never overwrite each other.
#[derive(Clone)]
pub struct LogClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    topic: String,
    connection: Box<dyn BrokerConnection>,
    channel: Arc<dyn BrokerChannel>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LogClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogClient")
            .field("topic", &self.inner.topic)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LogClient {
    /// Connect to RabbitMQ using `RABBITMQ_URL` (after loading `.env`) and
    /// declare the audit queue.
    ///
    /// # Errors
    ///
    /// See [`LogClient::initialize`].
    pub async fn initialize_audit_client() -> Result<Self> {
        Self::initialize(AUDIT_TOPIC_NAME).await
    }

    /// Connect to RabbitMQ using `RABBITMQ_URL` (after loading `.env`) and
    /// declare the activity queue.
    ///
    /// # Errors
    ///
    /// See [`LogClient::initialize`].
    pub async fn initialize_activity_client() -> Result<Self> {
        Self::initialize(ACTIVITY_TOPIC_NAME).await
    }

    /// Connect to RabbitMQ using `RABBITMQ_URL` (after loading `.env`) and
    /// declare `topic` as a durable, shared queue.
    ///
    /// # Errors
    ///
    /// `ConfigurationError` when the URL is missing, then `ConnectionError`,
    /// `ChannelError` or `QueueDeclarationError` for the setup step that failed.
    pub async fn initialize(topic: &str) -> Result<Self> {
        let config = BrokerConfig::load()?;
        Self::connect_with(&AmqpTransport, &config, topic).await
    }

    /// Connect through an explicit transport and configuration.
    ///
    /// # Errors
    ///
    /// `ConnectionError`, `ChannelError` or `QueueDeclarationError`. Anything
    /// opened before the failing step is closed again.
    pub async fn connect_with(
        transport: &dyn BrokerTransport,
        config: &BrokerConfig,
        topic: &str,
    ) -> Result<Self> {
        info!(broker = %config.redacted_url(), queue = topic, "Connecting log client");

        let connection = transport
            .connect(&config.url, config.connection_name.as_deref())
            .await
            .map_err(LogBusError::ConnectionError)?;

        let channel = match connection.open_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_quietly_connection(connection.as_ref()).await;
                return Err(LogBusError::ChannelError(e));
            }
        };

        if let Err(source) = channel
            .declare_queue(topic, QueueOptions::durable_shared())
            .await
        {
            close_quietly_channel(channel.as_ref()).await;
            close_quietly_connection(connection.as_ref()).await;
            return Err(LogBusError::QueueDeclarationError {
                queue: topic.to_string(),
                source,
            });
        }

        info!(queue = topic, "Log client ready");
        Ok(Self {
            inner: Arc::new(ClientInner {
                topic: topic.to_string(),
                connection,
                channel,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// The queue this handle declared.
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn channel_for(&self, topic: &str) -> Result<&dyn BrokerChannel> {
        if self.is_closed() || self.inner.topic != topic {
            return Err(LogBusError::NotInitializedError {
                topic: topic.to_string(),
            });
        }
        Ok(self.inner.channel.as_ref())
    }

    /// Stamp `record` with the current time, encode it as JSON and publish it
    /// to its queue through the default exchange.
    ///
    /// # Errors
    ///
    /// `NotInitializedError` when this handle is closed or was set up for a
    /// different topic, `SerializationError` if encoding fails, `PublishError`
    /// on transport failure. Nothing is retried.
    pub async fn publish<R: LogRecord>(&self, mut record: R) -> Result<()> {
        let channel = self.channel_for(R::TOPIC)?;

        record.stamp(Utc::now());
        let payload = serde_json::to_vec(&record).map_err(|source| {
            LogBusError::SerializationError {
                kind: R::KIND,
                source,
            }
        })?;

        channel
            .publish(R::TOPIC, &payload, JSON_CONTENT_TYPE)
            .await
            .map_err(|source| LogBusError::PublishError {
                kind: R::KIND,
                source,
            })?;

        debug!(queue = R::TOPIC, bytes = payload.len(), "Published {} log", R::KIND);
        Ok(())
    }

    /// # Errors
    ///
    /// See [`LogClient::publish`].
    pub async fn publish_audit_log(&self, log: AuditLog) -> Result<()> {
        self.publish(log).await
    }

    /// # Errors
    ///
    /// See [`LogClient::publish`].
    pub async fn publish_activity_log(&self, log: ActivityLog) -> Result<()> {
        self.publish(log).await
    }

    /// Apply the prefetch limit, register a manual-ack consumer on the record
    /// kind's queue and start the consume loop on its own task.
    ///
    /// Returns as soon as the consumer is registered.
    ///
    /// # Errors
    ///
    /// `NotInitializedError`, `QoSConfigurationError` or `SubscriptionError`.
    pub async fn consume<R, H>(&self, options: ConsumeOptions, handler: H) -> Result<ConsumerHandle>
    where
        R: LogRecord,
        H: LogHandler<R>,
    {
        let channel = self.channel_for(R::TOPIC)?;
        let consumer_tag = options.consumer_tag_or(R::DEFAULT_CONSUMER).to_string();

        channel
            .set_prefetch(options.prefetch_count)
            .await
            .map_err(|source| LogBusError::QoSConfigurationError {
                prefetch_count: options.prefetch_count,
                source,
            })?;

        let deliveries = channel
            .subscribe(R::TOPIC, &consumer_tag)
            .await
            .map_err(|source| LogBusError::SubscriptionError {
                kind: R::KIND,
                consumer: consumer_tag.clone(),
                source,
            })?;

        let handle = spawn_consume_loop::<R, H>(
            deliveries,
            handler,
            options.on_decode_failure,
            consumer_tag,
        );
        info!(
            queue = R::TOPIC,
            consumer = handle.consumer_tag(),
            prefetch = options.prefetch_count,
            "{} consumer is waiting for messages",
            R::KIND
        );
        Ok(handle)
    }

    /// # Errors
    ///
    /// See [`LogClient::consume`].
    pub async fn consume_audit_logs<H>(&self, options: ConsumeOptions, handler: H) -> Result<ConsumerHandle>
    where
        H: LogHandler<AuditLog>,
    {
        self.consume::<AuditLog, H>(options, handler).await
    }

    /// # Errors
    ///
    /// See [`LogClient::consume`].
    pub async fn consume_activity_logs<H>(
        &self,
        options: ConsumeOptions,
        handler: H,
    ) -> Result<ConsumerHandle>
    where
        H: LogHandler<ActivityLog>,
    {
        self.consume::<ActivityLog, H>(options, handler).await
    }

    /// Close the channel, then the connection. Failures are logged and
    /// ignored; calling this again, or on a clone, does nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        close_quietly_channel(self.inner.channel.as_ref()).await;
        close_quietly_connection(self.inner.connection.as_ref()).await;
        info!(queue = %self.inner.topic, "Log client closed");
    }
}

async fn close_quietly_channel(channel: &dyn BrokerChannel) {
    if let Err(e) = channel.close().await {
        warn!(error = %e, "Ignoring error while closing channel");
    }
}

async fn close_quietly_connection(connection: &dyn BrokerConnection) {
    if let Err(e) = connection.close().await {
        warn!(error = %e, "Ignoring error while closing connection");
    }
}
